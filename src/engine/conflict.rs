use chrono::Utc;

use crate::limits::{MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;

use super::store::ScheduleView;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// Would a session of `campaign` over `span` collide with anything already booked?
///
/// Physical rooms collide with occupied slots of other active campaigns in the
/// same room. Online rooms are checked once: the session collides only when
/// every facilitator of the campaign is busy, and always when it has none.
pub fn has_conflict<V>(view: &V, campaign: &Campaign, span: &Span) -> Result<bool, EngineError>
where
    V: ScheduleView + ?Sized,
{
    let mut online_checked = false;
    for room_id in &campaign.room_ids {
        let room = view.room(room_id).ok_or_else(|| {
            EngineError::Validation(format!(
                "campaign {} references unknown room {room_id}",
                campaign.id
            ))
        })?;
        match room.room_type {
            RoomType::Physical => {
                if !view.booked_intervals_for_room(room_id, span, &campaign.id)?.is_empty() {
                    return Ok(true);
                }
            }
            RoomType::Online => {
                if online_checked {
                    continue;
                }
                online_checked = true;
                if !any_facilitator_free(view, campaign, span)? {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

fn any_facilitator_free<V>(view: &V, campaign: &Campaign, span: &Span) -> Result<bool, EngineError>
where
    V: ScheduleView + ?Sized,
{
    for facilitator_id in view.facilitators_of(&campaign.id) {
        if !facilitator_busy(view, &facilitator_id, campaign, span)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn facilitator_busy<V>(
    view: &V,
    facilitator_id: &ulid::Ulid,
    campaign: &Campaign,
    span: &Span,
) -> Result<bool, EngineError>
where
    V: ScheduleView + ?Sized,
{
    for other in view.online_campaigns_for_facilitator(facilitator_id) {
        if other.id == campaign.id {
            continue;
        }
        let Some(duration) = other.duration_ms() else {
            continue;
        };
        let schedule = view.schedule(&other.id).ok_or_else(|| {
            EngineError::StateConflict(format!("schedule of campaign {} is not locked", other.id))
        })?;
        if schedule.occupied_overlapping(span, duration).next().is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}
