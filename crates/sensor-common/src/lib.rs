//! Primitives shared between the probe layer and the tracking engine:
//! process ids, timestamps and the raw notification records produced by
//! kernel probes.

pub mod raw;
pub mod time;

pub use raw::{RawEvent, RawEventError, RawPayload, TaskSnapshot};

pub use nix::unistd::Pid;

/// Utility function to pretty print an error with its sources.
///
/// By default Rust won't print the source of an error message, so we
/// use anyhow as an error pretty-printer.
pub fn log_error<E: std::error::Error + Send + Sync + 'static>(msg: &str, err: E) {
    log::error!("{}: {:?}", msg, anyhow::Error::from(err));
}

/// Serde helpers for [`Pid`], which is serialized as its raw `i32`.
pub mod serde_pid {
    use nix::unistd::Pid;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(pid: &Pid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i32(pid.as_raw())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Pid, D::Error> {
        i32::deserialize(deserializer).map(Pid::from_raw)
    }

    /// Same as the parent module, for `Option<Pid>` fields.
    pub mod option {
        use nix::unistd::Pid;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(pid: &Option<Pid>, serializer: S) -> Result<S::Ok, S::Error> {
            match pid {
                Some(pid) => serializer.serialize_some(&pid.as_raw()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Pid>, D::Error> {
            Ok(Option::<i32>::deserialize(deserializer)?.map(Pid::from_raw))
        }
    }
}
