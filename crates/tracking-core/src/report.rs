//! Fixed-width text rendering shared by the file table and file tree dumps.

use std::fmt::Write;

use sensor_common::Pid;

const HEADER: [&str; 5] = ["Path", "Device", "Inode", "PID", "Is Special"];

/// Column header line.
pub fn file_header(out: &mut String) {
    let _ = writeln!(
        out,
        "{:>40} | {:>10} | {:>10} | {:>6} | {:>10} |",
        HEADER[0], HEADER[1], HEADER[2], HEADER[3], HEADER[4]
    );
}

pub fn file_row(out: &mut String, path: &str, device: u64, inode: u64, pid: Pid, is_special: bool) {
    let _ = writeln!(
        out,
        "{:>40} | {:>10} | {:>10} | {:>6} | {:>10} |",
        path,
        device,
        inode,
        pid.as_raw(),
        if is_special { "YES" } else { "NO" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_are_fixed_width() {
        let mut out = String::new();
        file_header(&mut out);
        file_row(&mut out, "/etc/passwd", 8, 1234, Pid::from_raw(42), false);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), lines[1].len());
        assert!(lines[0].trim_start().starts_with("Path |"));
        assert!(lines[1].ends_with(" NO |"));
        assert!(lines[1].contains("|     42 |"));
    }
}
