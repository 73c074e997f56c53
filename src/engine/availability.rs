use chrono::NaiveDate;

use crate::model::*;

use super::conflict::has_conflict;
use super::store::ScheduleView;
use super::EngineError;

/// Lazy sequence of hourly start candidates for one campaign on one date.
///
/// Steps from `working_hours_start` to `max_start_time` inclusive, skipping
/// instants not strictly after `now`. Finite and deterministic for a given
/// view, date, room type and `now`.
pub struct Candidates<'a, V: ScheduleView + ?Sized> {
    view: &'a V,
    campaign: Option<Campaign>,
    day: Ms,
    next_offset: Ms,
    latest_offset: Ms,
    now: Ms,
}

pub fn generate_candidates<'a, V>(
    view: &'a V,
    campaign: &Campaign,
    date: NaiveDate,
    room_type: RoomType,
    now: Ms,
) -> Candidates<'a, V>
where
    V: ScheduleView + ?Sized,
{
    let has_room_of_type = campaign
        .room_ids
        .iter()
        .any(|id| view.room(id).is_some_and(|r| r.room_type == room_type));
    let window = campaign
        .start_window()
        .filter(|_| campaign.is_active && has_room_of_type);

    match window {
        Some((earliest, latest)) => Candidates {
            view,
            campaign: Some(campaign.clone()),
            day: day_start(date),
            next_offset: earliest,
            latest_offset: latest,
            now,
        },
        None => Candidates {
            view,
            campaign: None,
            day: 0,
            next_offset: 1,
            latest_offset: 0,
            now,
        },
    }
}

impl<V: ScheduleView + ?Sized> Iterator for Candidates<'_, V> {
    type Item = Result<TimeCandidate, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        let campaign = self.campaign.as_ref()?;
        let duration = campaign.duration_ms()?;
        while self.next_offset <= self.latest_offset {
            let start = self.day + self.next_offset;
            self.next_offset += HOUR_MS;
            if start <= self.now {
                continue;
            }

            let span = Span::new(start, start + duration);
            let current_players = self
                .view
                .slot_at(&campaign.id, start)
                .map(Slot::current_players)
                .unwrap_or(0);
            let has_seats = current_players < campaign.max_players;
            let available = has_seats
                && match has_conflict(self.view, campaign, &span) {
                    Ok(conflict) => !conflict,
                    Err(e) => return Some(Err(e)),
                };

            return Some(Ok(TimeCandidate {
                start: span.start,
                end: span.end,
                current_players,
                available_seats: campaign.max_players.saturating_sub(current_players),
                available,
            }));
        }
        None
    }
}

/// Only the candidates a booking could currently be made for.
pub fn available_times<V>(
    view: &V,
    campaign: &Campaign,
    date: NaiveDate,
    room_type: RoomType,
    now: Ms,
) -> Result<Vec<TimeCandidate>, EngineError>
where
    V: ScheduleView + ?Sized,
{
    let mut out = Vec::new();
    for candidate in generate_candidates(view, campaign, date, room_type, now) {
        let candidate = candidate?;
        if candidate.available {
            out.push(candidate);
        }
    }
    Ok(out)
}
