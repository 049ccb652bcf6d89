//! Broadcast of uncorrelated state changes.
//!
//! Updates go to the fan-out `IN_RESULTS` channel. Every observer subscribed
//! at publish time receives every update; observers joining a queue group
//! share them instead.

use std::sync::Arc;

use prost::Message;
use prost_types::Any;
use tracing::{debug, warn};

use crate::bus::{BusError, MessageBus, Subscription};
use crate::channels::UPDATE_CHANNEL;
use crate::envelope::{encode, UpdateEnvelope};

/// Errors publishing an update.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Transport error: {0}")]
    Transport(#[from] BusError),

    #[error("Failed to encode state: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Publishes state-change notifications.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn MessageBus>,
}

impl Notifier {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Broadcast the new `state` of `subject_id`.
    #[tracing::instrument(name = "notify", skip_all, fields(subject_id = %subject_id))]
    pub async fn notify(&self, subject_id: &str, state: Any) -> Result<(), NotifyError> {
        let update = UpdateEnvelope {
            subject_id: subject_id.to_string(),
            state: Some(state),
        };
        self.bus.publish(UPDATE_CHANNEL, encode(&update)).await?;
        debug!("Update published");
        Ok(())
    }

    /// Typed [`Notifier::notify`].
    pub async fn notify_message<M: prost::Name>(
        &self,
        subject_id: &str,
        state: &M,
    ) -> Result<(), NotifyError> {
        self.notify(subject_id, Any::from_msg(state)?).await
    }

    /// Observe every update published from now on.
    pub async fn update_subscription(&self) -> Result<UpdateObserver, BusError> {
        let subscription = self.bus.subscribe(UPDATE_CHANNEL).await?;
        Ok(UpdateObserver { subscription })
    }

    /// Observe updates as a member of `group`; each update reaches one member.
    pub async fn update_queue_subscription(&self, group: &str) -> Result<UpdateObserver, BusError> {
        let subscription = self.bus.subscribe_queue(UPDATE_CHANNEL, group).await?;
        Ok(UpdateObserver { subscription })
    }
}

/// Decoded stream of updates. Closing or dropping it unsubscribes.
#[derive(Debug)]
pub struct UpdateObserver {
    subscription: Subscription,
}

impl UpdateObserver {
    /// Next decodable update. Returns `None` once closed.
    pub async fn next(&mut self) -> Option<UpdateEnvelope> {
        loop {
            let message = self.subscription.next().await?;
            match UpdateEnvelope::decode(message) {
                Ok(update) => return Some(update),
                Err(e) => warn!(error = %e, "Skipping undecodable update"),
            }
        }
    }

    pub fn close(&mut self) -> Result<(), BusError> {
        self.subscription.close()
    }

    pub fn is_closed(&self) -> bool {
        self.subscription.is_closed()
    }
}
