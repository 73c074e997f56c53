use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::available_times;
use super::conflict::{has_conflict, now_ms, validate_instant};
use super::store::ScheduleView;
use super::{Engine, EngineError};

impl Engine {
    pub fn get_campaign(&self, id: &Ulid) -> Result<Campaign, EngineError> {
        self.store
            .campaign(id)
            .ok_or_else(|| EngineError::not_found("campaign", *id))
    }

    pub fn list_campaigns(&self) -> Vec<Campaign> {
        self.store
            .campaign_ids()
            .iter()
            .filter_map(|id| self.store.campaign(id))
            .collect()
    }

    pub fn get_room(&self, id: &Ulid) -> Result<Room, EngineError> {
        self.store
            .room(id)
            .ok_or_else(|| EngineError::not_found("room", *id))
    }

    pub fn list_rooms(&self) -> Vec<Room> {
        self.store.rooms()
    }

    /// Start times on `date` at which a booking for `campaign_id` could be made
    /// right now, in a room of `room_type`.
    pub async fn list_available_times(
        &self,
        campaign_id: &Ulid,
        date: NaiveDate,
        room_type: RoomType,
    ) -> Result<Vec<TimeCandidate>, EngineError> {
        self.list_available_times_at(campaign_id, date, room_type, now_ms())
            .await
    }

    /// [`Engine::list_available_times`] against an explicit clock.
    pub async fn list_available_times_at(
        &self,
        campaign_id: &Ulid,
        date: NaiveDate,
        room_type: RoomType,
        now: Ms,
    ) -> Result<Vec<TimeCandidate>, EngineError> {
        let snapshot = self.store.snapshot(campaign_id).await?;
        let campaign = snapshot
            .campaign(campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", *campaign_id))?;
        available_times(&snapshot, &campaign, date, room_type, now)
    }

    /// Speculative conflict check for a session of `campaign_id` starting at `start`.
    pub async fn check_conflict(&self, campaign_id: &Ulid, start: Ms) -> Result<bool, EngineError> {
        validate_instant(start)?;
        let snapshot = self.store.snapshot(campaign_id).await?;
        let campaign = snapshot
            .campaign(campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", *campaign_id))?;
        let span = campaign
            .session_span(start)
            .ok_or_else(|| EngineError::Validation("campaign has no session duration".into()))?;
        has_conflict(&snapshot, &campaign, &span)
    }

    pub async fn list_slots(&self, campaign_id: &Ulid) -> Result<Vec<SlotInfo>, EngineError> {
        let campaign = self.get_campaign(campaign_id)?;
        let handle = self
            .store
            .schedule_handle(campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", *campaign_id))?;
        let schedule = handle.read().await;
        let duration = campaign.duration_ms().unwrap_or(0);
        Ok(schedule
            .slots
            .iter()
            .map(|slot| SlotInfo {
                id: slot.id,
                campaign_id: slot.campaign_id,
                start: slot.start,
                end: slot.start + duration,
                current_players: slot.current_players(),
                available_seats: slot.available_seats(campaign.max_players).max(0) as u32,
                booking_count: slot.bookings.len(),
            })
            .collect())
    }

    /// All bookings of `user_id`, ordered by session start.
    pub async fn list_user_bookings(&self, user_id: &Ulid) -> Result<Vec<BookingInfo>, EngineError> {
        if self.store.user(user_id).is_none() {
            return Err(EngineError::not_found("user", *user_id));
        }

        let mut out = Vec::new();
        for booking_id in self.store.bookings_of_user(user_id) {
            let Some(location) = self.store.booking_ref(&booking_id) else {
                continue;
            };
            let (Some(campaign), Some(handle)) = (
                self.store.campaign(&location.campaign_id),
                self.store.schedule_handle(&location.campaign_id),
            ) else {
                continue;
            };
            let schedule = handle.read().await;
            // Skipped if it was cancelled after the index was read.
            if let Some((slot, booking)) = schedule.find_booking(&booking_id) {
                out.push(BookingInfo {
                    id: booking.id,
                    user_id: booking.user_id,
                    campaign_id: campaign.id,
                    campaign_title: campaign.title.clone(),
                    slot_id: slot.id,
                    start: slot.start,
                    end: slot.start + campaign.duration_ms().unwrap_or(0),
                    players_count: booking.players_count,
                    created_at: booking.created_at,
                });
            }
        }
        out.sort_by_key(|b| (b.start, b.id));
        Ok(out)
    }
}
