//! Process-wide message queue.
//!
//! Writers report progress and recoverable trouble here instead of
//! aborting. Each message carries a numeric code (see [`crate::error::codes`])
//! whose high byte is the severity. Messages at or above the print
//! threshold are echoed through the `log` facade; messages at or above the
//! abort threshold make [`submit`] return an error which the caller
//! propagates up to the writer loop.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use crate::error::{code_severity, IsoError, Result};

/// Message severities, lowest to highest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug = 0x28,
    Update = 0x30,
    Note = 0x38,
    Hint = 0x40,
    Warning = 0x48,
    Sorry = 0x50,
    Mishap = 0x54,
    Failure = 0x58,
    Fatal = 0x68,
    Abort = 0x71,
}

impl Severity {
    pub fn from_value(v: u8) -> Self {
        match v {
            0..=0x28 => Severity::Debug,
            0x29..=0x30 => Severity::Update,
            0x31..=0x38 => Severity::Note,
            0x39..=0x40 => Severity::Hint,
            0x41..=0x48 => Severity::Warning,
            0x49..=0x50 => Severity::Sorry,
            0x51..=0x54 => Severity::Mishap,
            0x55..=0x58 => Severity::Failure,
            0x59..=0x68 => Severity::Fatal,
            _ => Severity::Abort,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Update => "UPDATE",
            Severity::Note => "NOTE",
            Severity::Hint => "HINT",
            Severity::Warning => "WARNING",
            Severity::Sorry => "SORRY",
            Severity::Mishap => "MISHAP",
            Severity::Failure => "FAILURE",
            Severity::Fatal => "FATAL",
            Severity::Abort => "ABORT",
        }
    }
}

/// A queued message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Identifier of the image the message originates from.
    pub image_id: u32,
    /// Numeric code, severity in the high byte.
    pub code: u32,
    /// Code of the error that caused this one, 0 if none.
    pub caused_by: u32,
    pub severity: Severity,
    pub text: String,
}

struct QueueState {
    messages: VecDeque<Message>,
    queue_threshold: Severity,
    print_threshold: Severity,
    abort_threshold: Severity,
}

static QUEUE: OnceLock<Mutex<QueueState>> = OnceLock::new();

fn state() -> &'static Mutex<QueueState> {
    QUEUE.get_or_init(|| {
        Mutex::new(QueueState {
            messages: VecDeque::new(),
            queue_threshold: Severity::Note,
            print_threshold: Severity::Abort,
            abort_threshold: Severity::Failure,
        })
    })
}

/// Set the minimum severity a message needs to be queued.
pub fn set_queue_severity(sev: Severity) {
    state().lock().expect("message queue poisoned").queue_threshold = sev;
}

/// Set the minimum severity a message needs to be echoed via `log`.
pub fn set_print_severity(sev: Severity) {
    state().lock().expect("message queue poisoned").print_threshold = sev;
}

/// Set the severity at which [`submit`] starts returning an abort error.
/// Only `Note` through `Failure` are accepted, others are clamped.
pub fn set_abort_severity(sev: Severity) {
    let sev = sev.clamp(Severity::Note, Severity::Failure);
    state().lock().expect("message queue poisoned").abort_threshold = sev;
}

/// Drain all queued messages.
pub fn take_messages() -> Vec<Message> {
    state()
        .lock()
        .expect("message queue poisoned")
        .messages
        .drain(..)
        .collect()
}

/// Submit a message with the given code.
///
/// Returns `Err(IsoError::Abort { .. })` when the code's severity reaches
/// the configured abort threshold; the caller must propagate it so that
/// image generation stops.
pub fn submit(image_id: u32, code: u32, caused_by: u32, text: impl Into<String>) -> Result<()> {
    let text = text.into();
    let severity = code_severity(code);
    let mut st = state().lock().expect("message queue poisoned");

    if severity >= st.print_threshold {
        log::warn!("[{}] {}", severity.name(), text);
    } else {
        log::debug!("[{}] {}", severity.name(), text);
    }
    if severity >= st.queue_threshold {
        st.messages.push_back(Message {
            image_id,
            code,
            caused_by,
            severity,
            text: text.clone(),
        });
    }
    if severity >= st.abort_threshold {
        return Err(IsoError::Abort { code, text });
    }
    Ok(())
}

/// Submit a debug message. Never aborts, never queued, echoed via `log`.
pub fn debug(image_id: u32, text: impl AsRef<str>) {
    let _ = image_id;
    log::debug!("{}", text.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[test]
    fn severity_order() {
        assert!(Severity::Debug < Severity::Update);
        assert!(Severity::Mishap < Severity::Failure);
        assert!(Severity::Fatal < Severity::Abort);
    }

    #[test]
    fn hint_does_not_abort() {
        assert!(submit(0, codes::FILE_IGNORED, 0, "ignored").is_ok());
    }

    #[test]
    fn failure_aborts() {
        let err = submit(0, codes::FILE_TOO_BIG, 0, "too big").unwrap_err();
        match err {
            IsoError::Abort { code, .. } => assert_eq!(code, codes::FILE_TOO_BIG),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
