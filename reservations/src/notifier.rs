//! Confirmation notices, a downstream consumer of the event feed.
//!
//! [`ConfirmationNotifier`] subscribes to the publisher and sends one notice
//! per `ReservationConfirmed` through a [`NotificationGateway`]. Delivery is
//! at least once, so notices are deduplicated by `(aggregate_id, sequence)`.
//!
//! Events that happened before the notifier started are history: they are
//! folded into its reservation cache but never notified again. Restarts,
//! catch-up and gap repair therefore do not resend old notices.

use crate::aggregate::ReservationEvent;
use crate::types::{ReservationNumber, UserId};
use chrono::{DateTime, Utc};
use medtour_core::event::DomainEvent;
use medtour_core::event_bus::{DeliveryError, EventSubscriber};
use medtour_core::stream::{AggregateId, Version};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use thiserror::Error;

/// A confirmation to tell the patient about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationNotice {
    /// The confirmed reservation.
    pub reservation_id: AggregateId,
    /// Its number, if the creation event has been seen.
    pub reservation_number: Option<ReservationNumber>,
    /// Its patient, if the creation event has been seen.
    pub user_id: Option<UserId>,
    /// Who confirmed it.
    pub confirmed_by: String,
    /// When it was confirmed.
    pub confirmed_at: DateTime<Utc>,
}

/// The gateway could not send a notice. Always retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification gateway failed: {0}")]
pub struct GatewayError(pub String);

/// Outbound channel for notices (e-mail, SMS, push).
pub trait NotificationGateway: Send + Sync {
    /// Send one confirmation notice.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError` if the notice was not accepted.
    fn send_confirmation<'a>(
        &'a self,
        notice: &'a ConfirmationNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;
}

/// Gateway that only logs notices.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingNotificationGateway;

impl NotificationGateway for LoggingNotificationGateway {
    fn send_confirmation<'a>(
        &'a self,
        notice: &'a ConfirmationNotice,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(
                reservation_id = %notice.reservation_id,
                reservation_number = notice.reservation_number.as_ref().map(ReservationNumber::as_str),
                user_id = notice.user_id.as_ref().map(UserId::as_str),
                confirmed_by = %notice.confirmed_by,
                "Reservation confirmation notice"
            );
            Ok(())
        })
    }
}

/// `known` only holds reservations still awaiting a decision; `sent` grows
/// by one key per confirmation, like the read model grows by one row.
#[derive(Default)]
struct NotifierState {
    known: HashMap<AggregateId, (ReservationNumber, UserId)>,
    sent: HashSet<(AggregateId, Version)>,
}

/// Sends a notice for each newly confirmed reservation.
pub struct ConfirmationNotifier<G> {
    gateway: G,
    history_before: DateTime<Utc>,
    state: Mutex<NotifierState>,
}

impl<G: NotificationGateway> ConfirmationNotifier<G> {
    /// Subscriber name.
    pub const NAME: &'static str = "confirmation-notifier";

    /// Notify confirmations that occur at or after `history_before`.
    #[must_use]
    pub fn new(gateway: G, history_before: DateTime<Utc>) -> Self {
        Self {
            gateway,
            history_before,
            state: Mutex::new(NotifierState::default()),
        }
    }

    /// Number of notices sent so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.lock().sent.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NotifierState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn on_event(&self, event: &DomainEvent) -> Result<(), DeliveryError> {
        if !ReservationEvent::is_reservation_event(&event.event_type) {
            return Ok(());
        }
        let decoded: ReservationEvent = event
            .decode()
            .map_err(|e| DeliveryError::Permanent(e.to_string()))?;

        let confirmed_by = match decoded {
            ReservationEvent::Created { number, details } => {
                self.lock()
                    .known
                    .insert(event.aggregate_id.clone(), (number, details.user_id));
                return Ok(());
            }
            ReservationEvent::Cancelled { .. } => {
                self.lock().known.remove(&event.aggregate_id);
                return Ok(());
            }
            ReservationEvent::Confirmed { confirmed_by } => confirmed_by,
        };

        if event.occurred_at < self.history_before {
            return Ok(());
        }

        let key = (event.aggregate_id.clone(), event.sequence_number);
        let notice = {
            let state = self.lock();
            if state.sent.contains(&key) {
                return Ok(());
            }
            let known = state.known.get(&event.aggregate_id).cloned();
            ConfirmationNotice {
                reservation_id: event.aggregate_id.clone(),
                reservation_number: known.as_ref().map(|(number, _)| number.clone()),
                user_id: known.map(|(_, user)| user),
                confirmed_by,
                confirmed_at: event.occurred_at,
            }
        };

        self.gateway
            .send_confirmation(&notice)
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let mut state = self.lock();
        state.known.remove(&event.aggregate_id);
        state.sent.insert(key);
        Ok(())
    }
}

impl<G: NotificationGateway> EventSubscriber for ConfirmationNotifier<G> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn handle<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeliveryError>> + Send + 'a>> {
        Box::pin(self.on_event(event))
    }
}
