//! Sequential dispatch of an accepted batch.
//!
//! A single worker drains the batch queue, so at most one batch talks to the
//! session at a time. Each batch runs in its own task; if that task panics or
//! hits an impossible status transition the batch is still recorded, with
//! status `error` and whatever counts it reached.

use crate::context::{AppContext, DelayHandle};
use chrono::Utc;
use disparo_core::delay::compute_delay;
use disparo_core::events::{
    DispatchEvent, MessageUpdatePayload, SessionCompletePayload, SessionFailedPayload,
};
use disparo_core::phone;
use disparo_core::{BatchSession, ContactErrorCode, ContactRecord, TransitionError};
use std::{
    any::Any,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Decides how long to wait after a contact resolves.
pub trait Pacer: Send + Sync {
    fn delay_for(&self, consecutive_errors: u32) -> Duration;
}

/// Randomized pacing read from the live delay configuration.
pub struct DelayPolicy {
    delay: DelayHandle,
}

impl DelayPolicy {
    pub fn new(delay: DelayHandle) -> Self {
        Self { delay }
    }
}

impl Pacer for DelayPolicy {
    fn delay_for(&self, consecutive_errors: u32) -> Duration {
        let config = self.delay.get();
        compute_delay(&config, consecutive_errors, &mut rand::thread_rng())
    }
}

pub struct BatchJob {
    pub session: BatchSession,
    pub contacts: Vec<ContactRecord>,
}

/// Counts and resolved records shared with the worker so a halted batch
/// still reports how far it got.
#[derive(Debug, Default)]
pub struct BatchProgress {
    sent: AtomicUsize,
    failed: AtomicUsize,
    resolved: Mutex<Vec<ContactRecord>>,
}

impl BatchProgress {
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    fn record_sent(&self, contact: &ContactRecord) {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.record_resolved(contact);
    }

    fn record_failed(&self, contact: &ContactRecord) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.record_resolved(contact);
    }

    fn record_resolved(&self, contact: &ContactRecord) {
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(contact.clone());
    }

    /// Lay the records resolved so far over `contacts`, matching by id.
    pub fn merge_into(&self, mut contacts: Vec<ContactRecord>) -> Vec<ContactRecord> {
        let resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        for record in resolved.iter() {
            if let Some(slot) = contacts.iter_mut().find(|contact| contact.id == record.id) {
                *slot = record.clone();
            }
        }
        contacts
    }
}

fn publish_update(ctx: &AppContext, session_id: &str, contact: &ContactRecord) {
    ctx.publish(DispatchEvent::MessageUpdate(MessageUpdatePayload::for_contact(
        session_id,
        contact,
        Utc::now(),
    )));
}

/// Drive every contact through `sending` to a terminal status, in order,
/// pacing after each one.
pub async fn run_batch(
    ctx: &AppContext,
    session_id: &str,
    mut contacts: Vec<ContactRecord>,
    progress: &BatchProgress,
) -> Result<Vec<ContactRecord>, TransitionError> {
    let mut consecutive_errors: u32 = 0;
    for contact in contacts.iter_mut() {
        contact.begin_sending()?;
        publish_update(ctx, session_id, contact);

        match phone::normalize(&contact.raw_phone) {
            Err(err) => {
                warn!(
                    event = "contact_failed",
                    session_id = %session_id,
                    contact_id = contact.id,
                    error = %err
                );
                contact.mark_failed(ContactErrorCode::InvalidPhoneNumber, Utc::now())?;
                progress.record_failed(contact);
                consecutive_errors += 1;
            }
            Ok(address) => match ctx.gateway().send(&address, &contact.message_body).await {
                Ok(()) => {
                    debug!(event = "contact_sent", session_id = %session_id, contact_id = contact.id);
                    contact.mark_sent(Utc::now())?;
                    progress.record_sent(contact);
                    consecutive_errors = 0;
                }
                Err(err) => {
                    warn!(
                        event = "contact_failed",
                        session_id = %session_id,
                        contact_id = contact.id,
                        error = %err
                    );
                    contact.mark_failed(ContactErrorCode::MessageSendError, Utc::now())?;
                    progress.record_failed(contact);
                    consecutive_errors += 1;
                }
            },
        }
        publish_update(ctx, session_id, contact);

        let pause = ctx.pacer().delay_for(consecutive_errors);
        debug!(
            event = "pace",
            session_id = %session_id,
            consecutive_errors = consecutive_errors,
            millis = pause.as_millis() as u64
        );
        tokio::time::sleep(pause).await;
    }
    Ok(contacts)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "dispatch task panicked".to_string()
    }
}

async fn dispatch(ctx: &Arc<AppContext>, job: BatchJob) {
    let BatchJob {
        mut session,
        contacts,
    } = job;
    info!(event = "batch_start", session_id = %session.id, total = session.total_contacts);

    let progress = Arc::new(BatchProgress::default());
    let submitted = contacts.clone();
    let task = tokio::spawn({
        let ctx = ctx.clone();
        let progress = progress.clone();
        let session_id = session.id.clone();
        async move { run_batch(&ctx, &session_id, contacts, &progress).await }
    });
    let outcome = match task.await {
        Ok(Ok(resolved)) => {
            session.contacts = resolved;
            Ok(())
        }
        Ok(Err(err)) => Err(err.to_string()),
        Err(err) if err.is_panic() => Err(panic_message(err.into_panic())),
        Err(err) => Err(err.to_string()),
    };
    if outcome.is_err() {
        session.contacts = progress.merge_into(submitted);
    }

    session.sent_count = progress.sent();
    session.failed_count = progress.failed();
    let results = session.totals();
    let session_id = session.id.clone();
    match outcome {
        Ok(()) => {
            session.complete(Utc::now());
            info!(
                event = "batch_complete",
                session_id = %session_id,
                sent = results.sent,
                failed = results.failed
            );
            ctx.record_history(session).await;
            ctx.publish(DispatchEvent::SessionComplete(SessionCompletePayload {
                session_id,
                results,
            }));
        }
        Err(message) => {
            session.fail(Utc::now());
            error!(
                event = "batch_failed",
                session_id = %session_id,
                sent = results.sent,
                failed = results.failed,
                error = %message
            );
            ctx.record_history(session).await;
            ctx.publish(DispatchEvent::SessionFailed(SessionFailedPayload {
                session_id,
                error: message,
                results,
            }));
        }
    }
}

/// Drain the batch queue one job at a time.
pub async fn run_worker(ctx: Arc<AppContext>, mut queue: mpsc::Receiver<BatchJob>) {
    while let Some(job) = queue.recv().await {
        dispatch(&ctx, job).await;
    }
    debug!(event = "dispatch_worker_stop");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records the error streak it was asked about and always waits one second.
    #[derive(Default)]
    pub(crate) struct RecordingPacer {
        streaks: Mutex<Vec<u32>>,
    }

    impl RecordingPacer {
        pub(crate) fn streaks(&self) -> Vec<u32> {
            self.streaks.lock().expect("streaks lock").clone()
        }
    }

    impl Pacer for RecordingPacer {
        fn delay_for(&self, consecutive_errors: u32) -> Duration {
            self.streaks
                .lock()
                .expect("streaks lock")
                .push(consecutive_errors);
            Duration::from_secs(1)
        }
    }
}
