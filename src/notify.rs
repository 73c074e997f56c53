use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{format_timestamp, Ms};

const CHANNEL_CAPACITY: usize = 256;

/// Channel every booking notice is sent on, regardless of campaign.
pub const BOOKINGS_CHANNEL: &str = "bookings";

pub fn campaign_channel(campaign_id: &Ulid) -> String {
    format!("campaign_{campaign_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    BookingConfirmed,
    BookingCancelled,
}

/// What subscribers learn about a committed booking change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub kind: NoticeKind,
    pub booking_id: Ulid,
    pub campaign_id: Ulid,
    pub campaign_title: String,
    pub slot_id: Ulid,
    pub user_id: Ulid,
    #[serde(serialize_with = "serialize_instant")]
    pub start: Ms,
    pub players_count: u32,
}

fn serialize_instant<S: serde::Serializer>(ms: &Ms, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_timestamp(*ms))
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode notice: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
}

/// Outbound side effect of a committed booking. Fire-and-forget: the engine
/// logs failures and never rolls a booking back because of them.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_booking_confirmed(&self, notice: &BookingNotice) -> Result<(), PublishError>;

    async fn publish_booking_cancelled(&self, _notice: &BookingNotice) -> Result<(), PublishError> {
        Ok(())
    }
}

/// A payload delivered to LISTEN subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Broadcast hub for LISTEN/NOTIFY per channel.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel. Creates the channel if needed.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel: &str, payload: &str) {
        if let Some(sender) = self.channels.get(channel) {
            let _ = sender.send(Notification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
    }

    fn broadcast(&self, notice: &BookingNotice) -> Result<(), PublishError> {
        let payload = serde_json::to_string(notice)?;
        self.send(&campaign_channel(&notice.campaign_id), &payload);
        self.send(BOOKINGS_CHANNEL, &payload);
        Ok(())
    }
}

#[async_trait]
impl Publisher for NotifyHub {
    async fn publish_booking_confirmed(&self, notice: &BookingNotice) -> Result<(), PublishError> {
        self.broadcast(notice)
    }

    async fn publish_booking_cancelled(&self, notice: &BookingNotice) -> Result<(), PublishError> {
        self.broadcast(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(kind: NoticeKind) -> BookingNotice {
        BookingNotice {
            kind,
            booking_id: Ulid::new(),
            campaign_id: Ulid::new(),
            campaign_title: "Curse of Strahd".into(),
            slot_id: Ulid::new(),
            user_id: Ulid::new(),
            start: 1_900_000_000_000,
            players_count: 3,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive_on_both_channels() {
        let hub = NotifyHub::new();
        let n = notice(NoticeKind::BookingConfirmed);
        let mut by_campaign = hub.subscribe(&campaign_channel(&n.campaign_id));
        let mut all = hub.subscribe(BOOKINGS_CHANNEL);

        hub.publish_booking_confirmed(&n).await.unwrap();

        let a = by_campaign.recv().await.unwrap();
        let b = all.recv().await.unwrap();
        assert_eq!(a.payload, b.payload);
        assert_eq!(b.channel, BOOKINGS_CHANNEL);

        let json: serde_json::Value = serde_json::from_str(&a.payload).unwrap();
        assert_eq!(json["kind"], "booking_confirmed");
        assert_eq!(json["start"], "2030-03-17T17:46:40Z");
        assert_eq!(json["players_count"], 3);
        assert_eq!(json["campaign_title"], "Curse of Strahd");
    }

    #[tokio::test]
    async fn other_campaigns_are_not_notified() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(&campaign_channel(&Ulid::new()));
        hub.publish_booking_cancelled(&notice(NoticeKind::BookingCancelled))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(BOOKINGS_CHANNEL, "{}");
    }
}
