use anyhow::Result;
use comfy_table::{Attribute, Cell, Color, ContentArrangement, Table};
use sensor_common::Pid;
use tracking_core::{context::StatsSnapshot, posix_identity::OpCountersSnapshot};

use super::replay::ReplayStats;

pub struct TermPrinted;

/// Diagnostics printed on stderr, stdout carries the events.
pub trait TermPrintable {
    fn term_print(&self) -> Result<TermPrinted>;
}

impl TermPrintable for String {
    fn term_print(&self) -> Result<TermPrinted> {
        eprintln!("{self}");
        Ok(TermPrinted)
    }
}

impl TermPrintable for StatsSnapshot {
    fn term_print(&self) -> Result<TermPrinted> {
        key_value_table(&[
            ("op_cnt", self.op_cnt.to_string()),
            ("create", self.create.to_string()),
            ("exit", self.exit.to_string()),
            ("create_by_fork", self.create_by_fork.to_string()),
            ("create_by_exec", self.create_by_exec.to_string()),
            ("live_exec_identities", self.live_exec_identities.to_string()),
        ])
    }
}

impl TermPrintable for ReplayStats {
    fn term_print(&self) -> Result<TermPrinted> {
        key_value_table(&[
            ("records", self.records.to_string()),
            ("handled", self.handled.to_string()),
            ("dropped", self.dropped.to_string()),
            ("malformed", self.malformed.to_string()),
        ])
    }
}

/// Per process activity counters.
#[derive(Debug, Clone)]
pub struct ProcessCounters {
    pub pid: Pid,
    pub name: String,
    pub counters: OpCountersSnapshot,
}

impl TermPrintable for Vec<ProcessCounters> {
    fn term_print(&self) -> Result<TermPrinted> {
        let sorted = {
            let mut tmp = self.clone();
            tmp.sort_by_key(|process| process.pid.as_raw());
            tmp
        };

        let mut table = table();

        table.set_header(vec![
            Cell::new("PID").add_attribute(Attribute::Bold),
            Cell::new("NAME").add_attribute(Attribute::Bold),
            Cell::new("PROCESS").add_attribute(Attribute::Bold),
            Cell::new("FILE").add_attribute(Attribute::Bold),
            Cell::new("NET").add_attribute(Attribute::Bold),
        ]);

        for process in sorted {
            let counters = process.counters;
            table.add_row(vec![
                Cell::new(process.pid)
                    .fg(Color::Cyan)
                    .add_attribute(Attribute::Bold),
                Cell::new(process.name),
                Cell::new(format!(
                    "{} (create {}, exit {})",
                    counters.process_op_cnt, counters.process_create, counters.process_exit
                )),
                Cell::new(format!(
                    "{} (open {}, write {}, close {})",
                    counters.file_op_cnt, counters.file_open, counters.file_write, counters.file_close
                )),
                Cell::new(format!(
                    "{} (connect {}, accept {}, dns {})",
                    counters.net_op_cnt, counters.net_connect, counters.net_accept, counters.net_dns
                )),
            ]);
        }

        eprintln!("{table}");
        Ok(TermPrinted)
    }
}

fn key_value_table(rows: &[(&str, String)]) -> Result<TermPrinted> {
    let mut table = table();

    table.set_header(vec![
        Cell::new("KEY").add_attribute(Attribute::Bold),
        Cell::new("VALUE").add_attribute(Attribute::Bold),
    ]);

    for (key, value) in rows {
        table.add_row(vec![
            Cell::new(key).fg(Color::Cyan).add_attribute(Attribute::Bold),
            Cell::new(value),
        ]);
    }

    eprintln!("{table}");
    Ok(TermPrinted)
}

fn table() -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);

    table
}
