use crate::{BatchTotals, ContactErrorCode, ContactRecord, ContactStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames published to real-time observers as `{"event": ..., "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum DispatchEvent {
    QrCode(QrCodePayload),
    WhatsappReady(ReadyPayload),
    WhatsappDisconnected(DisconnectedPayload),
    MessageSession(MessageSessionPayload),
    MessageUpdate(MessageUpdatePayload),
    SessionComplete(SessionCompletePayload),
    SessionFailed(SessionFailedPayload),
}

impl DispatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::QrCode(_) => "qrCode",
            DispatchEvent::WhatsappReady(_) => "whatsappReady",
            DispatchEvent::WhatsappDisconnected(_) => "whatsappDisconnected",
            DispatchEvent::MessageSession(_) => "messageSession",
            DispatchEvent::MessageUpdate(_) => "messageUpdate",
            DispatchEvent::SessionComplete(_) => "sessionComplete",
            DispatchEvent::SessionFailed(_) => "sessionFailed",
        }
    }

    /// Batch the event belongs to, for batch-scoped events.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            DispatchEvent::MessageSession(payload) => Some(&payload.session_id),
            DispatchEvent::MessageUpdate(payload) => Some(&payload.session_id),
            DispatchEvent::SessionComplete(payload) => Some(&payload.session_id),
            DispatchEvent::SessionFailed(payload) => Some(&payload.session_id),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrCodePayload {
    pub qr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadyPayload {
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectedPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageSessionPayload {
    pub session_id: String,
    pub contacts: Vec<ContactRecord>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdatePayload {
    pub session_id: String,
    pub contact_id: usize,
    pub status: ContactStatus,
    pub error: Option<ContactErrorCode>,
    pub timestamp: DateTime<Utc>,
}

impl MessageUpdatePayload {
    /// Update for the contact's current status. Terminal updates carry the
    /// resolution time; `sending` carries `now`.
    pub fn for_contact(session_id: &str, contact: &ContactRecord, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            contact_id: contact.id,
            status: contact.status,
            error: contact.error_code,
            timestamp: contact.sent_at.unwrap_or(now),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompletePayload {
    pub session_id: String,
    pub results: BatchTotals,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionFailedPayload {
    pub session_id: String,
    pub error: String,
    pub results: BatchTotals,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn message_update_wire_shape() {
        let at = Utc
            .timestamp_millis_opt(1_760_000_000_000)
            .single()
            .expect("valid timestamp");
        let mut contact = ContactRecord::new(1, None, "123", "Oi");
        contact.begin_sending().expect("sending");
        contact
            .mark_failed(ContactErrorCode::InvalidPhoneNumber, at)
            .expect("failed");

        let event = DispatchEvent::MessageUpdate(MessageUpdatePayload::for_contact(
            "batch-1",
            &contact,
            Utc::now(),
        ));
        let json: serde_json::Value =
            serde_json::from_str(&event.to_json().expect("encode")).expect("decode");
        assert_eq!(json["event"], "messageUpdate");
        assert_eq!(json["data"]["sessionId"], "batch-1");
        assert_eq!(json["data"]["contactId"], 1);
        assert_eq!(json["data"]["status"], "error");
        assert_eq!(json["data"]["error"], "INVALID_PHONE_NUMBER");
        assert_eq!(json["data"]["timestamp"], "2025-10-09T08:53:20Z");
    }

    #[test]
    fn completion_and_session_events_are_tagged() {
        let complete = DispatchEvent::SessionComplete(SessionCompletePayload {
            session_id: "batch-1".to_string(),
            results: BatchTotals {
                total: 2,
                sent: 1,
                failed: 1,
            },
        });
        let json = serde_json::to_value(&complete).expect("encode");
        assert_eq!(json["event"], "sessionComplete");
        assert_eq!(json["data"]["results"]["total"], 2);
        assert_eq!(complete.session_id(), Some("batch-1"));

        let ready = DispatchEvent::WhatsappReady(ReadyPayload { connected: true });
        let json = serde_json::to_value(&ready).expect("encode");
        assert_eq!(json["event"], "whatsappReady");
        assert_eq!(json["data"]["connected"], true);
        assert_eq!(ready.name(), "whatsappReady");
        assert!(ready.session_id().is_none());
    }

    #[test]
    fn message_session_lists_contacts() {
        let contacts = vec![ContactRecord::new(0, Some("Ana".to_string()), "11987654321", "Oi")];
        let event = DispatchEvent::MessageSession(MessageSessionPayload {
            session_id: "batch-9".to_string(),
            total: contacts.len(),
            contacts,
        });
        let json = serde_json::to_value(&event).expect("encode");
        assert_eq!(json["data"]["total"], 1);
        assert_eq!(json["data"]["contacts"][0]["displayName"], "Ana");
        assert_eq!(json["data"]["contacts"][0]["status"], "pending");
    }
}
