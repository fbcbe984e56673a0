pub mod batch_loader;
pub mod bridge_ipc;
pub mod delay;
pub mod events;
pub mod history;
pub mod phone;
pub mod session;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    #[default]
    Pending,
    Sending,
    Sent,
    Error,
}

impl ContactStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatus::Pending => "pending",
            ContactStatus::Sending => "sending",
            ContactStatus::Sent => "sent",
            ContactStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContactStatus::Sent | ContactStatus::Error)
    }
}

impl fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "pending" => Ok(ContactStatus::Pending),
            "sending" => Ok(ContactStatus::Sending),
            "sent" => Ok(ContactStatus::Sent),
            "error" | "failed" => Ok(ContactStatus::Error),
            other => Err(format!("Unknown contact status: {other}")),
        }
    }
}

/// Per-contact failure recorded on a [`ContactRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactErrorCode {
    InvalidPhoneNumber,
    MessageSendError,
}

impl ContactErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactErrorCode::InvalidPhoneNumber => "INVALID_PHONE_NUMBER",
            ContactErrorCode::MessageSendError => "MESSAGE_SEND_ERROR",
        }
    }
}

impl fmt::Display for ContactErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal contact transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ContactStatus,
    pub to: ContactStatus,
}

/// One row of an uploaded batch.
///
/// Status only moves forward: `pending -> sending -> (sent | error)`. The
/// transition methods refuse anything else, so a record that reached a
/// terminal status keeps it for the life of the batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: usize,
    #[serde(default)]
    pub display_name: Option<String>,
    pub raw_phone: String,
    pub message_body: String,
    #[serde(default)]
    pub status: ContactStatus,
    #[serde(default)]
    pub error_code: Option<ContactErrorCode>,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
}

impl ContactRecord {
    pub fn new(
        id: usize,
        display_name: Option<String>,
        raw_phone: impl Into<String>,
        message_body: impl Into<String>,
    ) -> Self {
        Self {
            id,
            display_name: display_name.filter(|name| !name.is_empty()),
            raw_phone: raw_phone.into(),
            message_body: message_body.into(),
            status: ContactStatus::Pending,
            error_code: None,
            sent_at: None,
        }
    }

    pub fn begin_sending(&mut self) -> Result<(), TransitionError> {
        self.transition(ContactStatus::Pending, ContactStatus::Sending)
    }

    pub fn mark_sent(&mut self, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(ContactStatus::Sending, ContactStatus::Sent)?;
        self.error_code = None;
        self.sent_at = Some(at);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        code: ContactErrorCode,
        at: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(ContactStatus::Sending, ContactStatus::Error)?;
        self.error_code = Some(code);
        self.sent_at = Some(at);
        Ok(())
    }

    fn transition(
        &mut self,
        expected: ContactStatus,
        next: ContactStatus,
    ) -> Result<(), TransitionError> {
        if self.status != expected {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Processing,
    Completed,
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Error => "error",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchTotals {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Summary of one uploaded batch. Counters move as contacts resolve, so
/// `sent_count + failed_count` always equals the number of contacts that
/// left `pending`.
///
/// Finished batches also carry their contact records, kept in memory only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchSession {
    pub id: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub total_contacts: usize,
    #[serde(rename = "sent")]
    pub sent_count: usize,
    #[serde(rename = "failed")]
    pub failed_count: usize,
    pub status: BatchStatus,
    #[serde(skip)]
    pub contacts: Vec<ContactRecord>,
}

impl BatchSession {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        total_contacts: usize,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            created_at,
            completed_at: None,
            total_contacts,
            sent_count: 0,
            failed_count: 0,
            status: BatchStatus::Processing,
            contacts: Vec::new(),
        }
    }

    pub fn record_sent(&mut self) {
        self.sent_count += 1;
    }

    pub fn record_failed(&mut self) {
        self.failed_count += 1;
    }

    pub fn resolved(&self) -> usize {
        self.sent_count + self.failed_count
    }

    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = BatchStatus::Completed;
        self.completed_at = Some(at);
    }

    /// Terminal state for a batch whose pipeline halted before draining.
    pub fn fail(&mut self, at: DateTime<Utc>) {
        self.status = BatchStatus::Error;
        self.completed_at = Some(at);
    }

    pub fn totals(&self) -> BatchTotals {
        BatchTotals {
            total: self.total_contacts,
            sent: self.sent_count,
            failed: self.failed_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn contact_moves_pending_sending_sent() {
        let mut contact = ContactRecord::new(0, Some("Ana".to_string()), "11987654321", "Oi");
        assert_eq!(contact.status, ContactStatus::Pending);
        contact.begin_sending().expect("sending");
        contact.mark_sent(ts()).expect("sent");
        assert_eq!(contact.status, ContactStatus::Sent);
        assert_eq!(contact.sent_at, Some(ts()));
        assert!(contact.error_code.is_none());
    }

    #[test]
    fn contact_rejects_skipping_sending_and_reentry() {
        let mut contact = ContactRecord::new(1, None, "123", "Oi");
        let err = contact.mark_sent(ts()).expect_err("cannot skip sending");
        assert_eq!(err.from, ContactStatus::Pending);

        contact.begin_sending().expect("sending");
        assert!(contact.begin_sending().is_err());
        contact
            .mark_failed(ContactErrorCode::InvalidPhoneNumber, ts())
            .expect("failed");
        assert!(contact.mark_sent(ts()).is_err());
        assert_eq!(contact.status, ContactStatus::Error);
        assert_eq!(contact.error_code, Some(ContactErrorCode::InvalidPhoneNumber));
    }

    #[test]
    fn empty_display_name_is_dropped() {
        let contact = ContactRecord::new(0, Some(String::new()), "1", "m");
        assert!(contact.display_name.is_none());
    }

    #[test]
    fn batch_session_serializes_history_shape() {
        let mut batch = BatchSession::new("1760000000000", "contacts.csv", 2, ts());
        batch.record_sent();
        batch.record_failed();
        batch.complete(ts());
        let json = serde_json::to_value(&batch).expect("serialize");
        assert_eq!(json["fileName"], "contacts.csv");
        assert_eq!(json["totalContacts"], 2);
        assert_eq!(json["sent"], 1);
        assert_eq!(json["failed"], 1);
        assert_eq!(json["status"], "completed");
        assert_eq!(batch.resolved(), 2);

        batch.contacts = vec![ContactRecord::new(0, None, "11987654321", "Oi")];
        let json = serde_json::to_value(&batch).expect("serialize");
        assert!(json.get("contacts").is_none());
    }

    #[test]
    fn status_parses_aliases() {
        assert_eq!("failed".parse::<ContactStatus>(), Ok(ContactStatus::Error));
        assert_eq!(" Sent ".parse::<ContactStatus>(), Ok(ContactStatus::Sent));
        assert!("bogus".parse::<ContactStatus>().is_err());
    }
}
