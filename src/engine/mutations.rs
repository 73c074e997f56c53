use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{BookingNotice, NoticeKind};
use crate::observability;

use super::conflict::{has_conflict, now_ms, validate_instant};
use super::store::{LockScope, ScheduleView};
use super::{Engine, EngineError};

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

impl Engine {
    // ── Catalog ──────────────────────────────────────────────

    pub async fn create_room(
        &self,
        id: Ulid,
        name: String,
        room_type: RoomType,
        capacity: Option<u32>,
    ) -> Result<(), EngineError> {
        if self.store.room_count() >= MAX_ROOMS {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        check_name(&name, "room name")?;
        if self.store.room(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let room = Room::new(id, name, room_type, capacity)?;

        let mut txn = self.store.begin(LockScope::Exact(Vec::new()), 0).await?;
        txn.stage(Event::RoomCreated {
            id: room.id,
            name: room.name,
            room_type: room.room_type,
            capacity: room.capacity,
        });
        txn.commit().await
    }

    pub async fn create_campaign(&self, spec: CampaignSpec) -> Result<Campaign, EngineError> {
        if self.store.campaign_count() >= MAX_CAMPAIGNS {
            return Err(EngineError::LimitExceeded("too many campaigns"));
        }
        check_name(&spec.title, "campaign title")?;
        if spec.description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if self.store.campaign(&spec.id).is_some() {
            return Err(EngineError::AlreadyExists(spec.id));
        }
        let campaign = Campaign::new(spec)?;
        if campaign.room_ids.len() > MAX_ROOMS_PER_CAMPAIGN {
            return Err(EngineError::LimitExceeded("too many rooms for one campaign"));
        }
        for room_id in &campaign.room_ids {
            if self.store.room(room_id).is_none() {
                return Err(EngineError::not_found("room", *room_id));
            }
        }

        let mut txn = self.store.begin(LockScope::Exact(Vec::new()), 0).await?;
        txn.stage(Event::CampaignCreated {
            campaign: campaign.clone(),
        });
        txn.commit().await?;
        info!(campaign_id = %campaign.id, title = %campaign.title, "campaign created");
        Ok(campaign)
    }

    /// Add a room to a campaign. Assigning a room twice is a no-op.
    pub async fn assign_room(&self, campaign_id: Ulid, room_id: Ulid) -> Result<(), EngineError> {
        let campaign = self
            .store
            .campaign(&campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        if self.store.room(&room_id).is_none() {
            return Err(EngineError::not_found("room", room_id));
        }
        if campaign.room_ids.contains(&room_id) {
            return Ok(());
        }
        if campaign.room_ids.len() >= MAX_ROOMS_PER_CAMPAIGN {
            return Err(EngineError::LimitExceeded("too many rooms for one campaign"));
        }

        let mut affected = self.store.campaigns_in_room(&room_id);
        affected.push(campaign_id);
        let mut txn = self.store.begin(LockScope::Exact(affected), 0).await?;
        txn.stage(Event::CampaignRoomAssigned {
            campaign_id,
            room_id,
        });
        txn.commit().await
    }

    pub async fn create_facilitator(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if self.store.facilitator_count() >= MAX_FACILITATORS {
            return Err(EngineError::LimitExceeded("too many facilitators"));
        }
        check_name(&name, "facilitator name")?;
        if self.store.facilitator(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut txn = self.store.begin(LockScope::Exact(Vec::new()), 0).await?;
        txn.stage(Event::FacilitatorCreated { id, name });
        txn.commit().await
    }

    /// Let a facilitator run a campaign. Assigning twice is a no-op.
    pub async fn assign_facilitator(
        &self,
        facilitator_id: Ulid,
        campaign_id: Ulid,
    ) -> Result<(), EngineError> {
        let facilitator = self
            .store
            .facilitator(&facilitator_id)
            .ok_or_else(|| EngineError::not_found("facilitator", facilitator_id))?;
        if self.store.campaign(&campaign_id).is_none() {
            return Err(EngineError::not_found("campaign", campaign_id));
        }
        if facilitator.campaign_ids.contains(&campaign_id) {
            return Ok(());
        }

        let mut affected = facilitator.campaign_ids;
        affected.push(campaign_id);
        let mut txn = self.store.begin(LockScope::Exact(affected), 0).await?;
        txn.stage(Event::FacilitatorAssigned {
            facilitator_id,
            campaign_id,
        });
        txn.commit().await
    }

    pub async fn register_user(&self, id: Ulid, name: String) -> Result<(), EngineError> {
        if self.store.user_count() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        check_name(&name, "user name")?;
        if self.store.user(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut txn = self.store.begin(LockScope::Exact(Vec::new()), 0).await?;
        txn.stage(Event::UserRegistered { id, name });
        txn.commit().await
    }

    /// Soft delete: existing bookings stay, new bookings are refused and the
    /// campaign stops blocking its rooms and facilitators.
    pub async fn deactivate_campaign(&self, id: Ulid) -> Result<(), EngineError> {
        let mut txn = self.store.begin(LockScope::Exact(vec![id]), 0).await?;
        let campaign = txn
            .campaign(&id)
            .ok_or_else(|| EngineError::not_found("campaign", id))?;
        if !campaign.is_active {
            return Ok(());
        }
        txn.stage(Event::CampaignDeactivated { id });
        txn.commit().await?;
        info!(campaign_id = %id, "campaign deactivated");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Reserve `players_count` seats in the session of `campaign_id` starting
    /// at `start`, opening the slot if this is its first booking.
    pub async fn create_booking(
        &self,
        id: Ulid,
        user_id: Ulid,
        campaign_id: Ulid,
        start: Ms,
        players_count: u32,
    ) -> Result<BookingInfo, EngineError> {
        let result = self
            .try_create_booking(id, user_id, campaign_id, start, players_count)
            .await;
        match &result {
            Ok(booking) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                info!(
                    booking_id = %booking.id,
                    %campaign_id,
                    start = %format_timestamp(booking.start),
                    players_count,
                    "booking confirmed"
                );
                self.publish(BookingNotice {
                    kind: NoticeKind::BookingConfirmed,
                    booking_id: booking.id,
                    campaign_id,
                    campaign_title: booking.campaign_title.clone(),
                    slot_id: booking.slot_id,
                    user_id,
                    start: booking.start,
                    players_count,
                })
                .await;
            }
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.kind())
                    .increment(1);
            }
        }
        result
    }

    async fn try_create_booking(
        &self,
        id: Ulid,
        user_id: Ulid,
        campaign_id: Ulid,
        start: Ms,
        players_count: u32,
    ) -> Result<BookingInfo, EngineError> {
        validate_instant(start)?;
        if !(MIN_PLAYERS_PER_BOOKING..=MAX_PLAYERS_PER_BOOKING).contains(&players_count) {
            return Err(EngineError::Validation(format!(
                "players_count must be between {MIN_PLAYERS_PER_BOOKING} and {MAX_PLAYERS_PER_BOOKING}, got {players_count}"
            )));
        }
        if self.store.user(&user_id).is_none() {
            return Err(EngineError::not_found("user", user_id));
        }
        let campaign = self
            .store
            .campaign(&campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        ensure_bookable(&campaign)?;
        if self.store.booking_ref(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }

        let mut txn = self
            .store
            .begin(LockScope::Contention(campaign_id), self.config.contention_retries)
            .await?;

        // Authoritative re-read: the catalog may have changed before the locks were taken.
        let campaign = txn
            .campaign(&campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", campaign_id))?;
        ensure_bookable(&campaign)?;
        let span = campaign
            .session_span(start)
            .ok_or_else(|| EngineError::Validation("campaign has no session duration".into()))?;

        if has_conflict(&txn, &campaign, &span)? {
            return Err(EngineError::Conflict(format!(
                "session {} - {} overlaps a booked session sharing a room or facilitator",
                format_timestamp(span.start),
                format_timestamp(span.end)
            )));
        }

        let now = now_ms();
        let existing = txn.slot_at(&campaign_id, start).map(|slot| {
            (
                slot.id,
                slot.booking_of(&user_id).map(|b| b.id),
                slot.available_seats(campaign.max_players).max(0) as u32,
            )
        });

        let slot_id = match existing {
            None => {
                if !campaign.accepts_start(start) {
                    return Err(EngineError::Validation(format!(
                        "start {} is outside working hours {} - {} for a {}h session",
                        format_timestamp(start),
                        campaign.working_hours_start,
                        campaign.working_hours_end,
                        campaign.duration_hours.unwrap_or_default()
                    )));
                }
                if start < now {
                    return Err(EngineError::PastTime(start));
                }
                if players_count > campaign.max_players {
                    return Err(EngineError::Capacity {
                        requested: players_count,
                        available: campaign.max_players,
                    });
                }
                let slot_count = txn.schedule(&campaign_id).map_or(0, |s| s.slots.len());
                if slot_count >= MAX_SLOTS_PER_CAMPAIGN {
                    return Err(EngineError::LimitExceeded("too many slots for one campaign"));
                }
                txn.add_slot(campaign_id, start)
            }
            Some((slot_id, already_booked, available)) => {
                if start < now {
                    return Err(EngineError::PastTime(start));
                }
                if let Some(existing_id) = already_booked {
                    return Err(EngineError::AlreadyExists(existing_id));
                }
                if players_count > available {
                    return Err(EngineError::Capacity {
                        requested: players_count,
                        available,
                    });
                }
                slot_id
            }
        };

        let booking = Booking {
            id,
            user_id,
            slot_id,
            players_count,
            created_at: now,
        };
        txn.add_booking(campaign_id, slot_id, &booking);
        txn.commit().await?;

        Ok(BookingInfo {
            id,
            user_id,
            campaign_id,
            campaign_title: campaign.title,
            slot_id,
            start: span.start,
            end: span.end,
            players_count,
            created_at: now,
        })
    }

    /// Cancel a booking owned by `user_id`. The slot is pruned when its last
    /// booking goes.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        user_id: Ulid,
    ) -> Result<BookingInfo, EngineError> {
        let location = self
            .store
            .booking_ref(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        if location.user_id != user_id {
            return Err(EngineError::Unauthorized {
                booking: booking_id,
                user: user_id,
            });
        }

        let mut txn = self
            .store
            .begin(LockScope::Exact(vec![location.campaign_id]), 0)
            .await?;
        let campaign = txn
            .campaign(&location.campaign_id)
            .ok_or_else(|| EngineError::not_found("campaign", location.campaign_id))?;
        let schedule = txn.schedule(&location.campaign_id).ok_or_else(|| {
            EngineError::StateConflict(format!(
                "schedule of campaign {} is not locked",
                location.campaign_id
            ))
        })?;
        // Gone between the index lookup and the lock: cancelled concurrently.
        let (slot, booking) = schedule
            .find_booking(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;

        let now = now_ms();
        if slot.is_in_past(now) {
            return Err(EngineError::PastTime(slot.start));
        }
        let lead = self.config.cancellation_lead_ms;
        if slot.start - now < lead {
            return Err(EngineError::Validation(format!(
                "bookings can only be cancelled at least {} minutes before the session starts",
                lead / MINUTE_MS
            )));
        }

        let info = BookingInfo {
            id: booking.id,
            user_id: booking.user_id,
            campaign_id: campaign.id,
            campaign_title: campaign.title.clone(),
            slot_id: slot.id,
            start: slot.start,
            end: slot.start + campaign.duration_ms().unwrap_or(0),
            players_count: booking.players_count,
            created_at: booking.created_at,
        };
        txn.delete_booking(booking_id, campaign.id, info.slot_id);
        txn.commit().await?;

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!(%booking_id, campaign_id = %campaign.id, "booking cancelled");
        self.publish(BookingNotice {
            kind: NoticeKind::BookingCancelled,
            booking_id,
            campaign_id: campaign.id,
            campaign_title: info.campaign_title.clone(),
            slot_id: info.slot_id,
            user_id,
            start: info.start,
            players_count: info.players_count,
        })
        .await;
        Ok(info)
    }

    /// Best effort: the booking is already committed, so failures are only logged.
    async fn publish(&self, notice: BookingNotice) {
        let result = match notice.kind {
            NoticeKind::BookingConfirmed => self.publisher.publish_booking_confirmed(&notice).await,
            NoticeKind::BookingCancelled => self.publisher.publish_booking_cancelled(&notice).await,
        };
        if let Err(e) = result {
            warn!(booking_id = %notice.booking_id, error = %e, "failed to publish booking notice");
        }
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.store.compact().await
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.store.wal_appends_since_compact().await
    }
}

fn ensure_bookable(campaign: &Campaign) -> Result<(), EngineError> {
    if !campaign.is_active {
        return Err(EngineError::Validation(format!(
            "campaign {} is not active",
            campaign.id
        )));
    }
    if !campaign.is_schedulable() {
        return Err(EngineError::Validation(format!(
            "campaign {} has no session duration and cannot be booked",
            campaign.id
        )));
    }
    Ok(())
}
