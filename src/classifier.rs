use chrono::{DateTime, Duration, FixedOffset, Utc};

use crate::clock::at_local;
use crate::models::{DateWindow, ParticipationLabel};

/// Which summary counter a check-in lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckinBucket {
    OnTime,
    Late,
}

/// Classifies check-in/check-out timestamps against one scheduled window.
#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    tolerance: Duration,
    tz: FixedOffset,
}

impl Classifier {
    pub fn new(tolerance_minutes: i64, tz: FixedOffset) -> Self {
        Self {
            tolerance: Duration::minutes(tolerance_minutes),
            tz,
        }
    }

    pub fn tz(&self) -> FixedOffset {
        self.tz
    }

    /// `[start - tolerance, start + tolerance]` in UTC for the window's date.
    pub fn acceptance(&self, window: &DateWindow) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = at_local(window.date, window.start, self.tz);
        (start - self.tolerance, start + self.tolerance)
    }

    pub fn bucket(&self, window: &DateWindow, checkin: DateTime<Utc>) -> CheckinBucket {
        let (open, close) = self.acceptance(window);
        if checkin >= open && checkin <= close {
            CheckinBucket::OnTime
        } else {
            CheckinBucket::Late
        }
    }

    pub fn classify(
        &self,
        window: Option<&DateWindow>,
        checkin: Option<DateTime<Utc>>,
        checkout: Option<DateTime<Utc>>,
    ) -> ParticipationLabel {
        let Some(window) = window else {
            return ParticipationLabel::NoWindow;
        };
        match (checkin, checkout) {
            (Some(checkin), Some(_)) => match self.bucket(window, checkin) {
                CheckinBucket::OnTime => ParticipationLabel::OnTime,
                CheckinBucket::Late => ParticipationLabel::Late,
            },
            (Some(_), None) => ParticipationLabel::CheckinOnly,
            (None, _) => ParticipationLabel::Absent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use proptest::prelude::*;

    fn classifier() -> Classifier {
        Classifier::new(30, FixedOffset::east_opt(7 * 3600).unwrap())
    }

    fn window() -> DateWindow {
        "2025-03-15 09:00-12:00 4".parse().unwrap()
    }

    fn local(hh: u32, mm: u32) -> DateTime<Utc> {
        at_local(
            NaiveDate::from_ymd_opt(2025, 3, 15).unwrap(),
            NaiveTime::from_hms_opt(hh, mm, 0).unwrap(),
            FixedOffset::east_opt(7 * 3600).unwrap(),
        )
    }

    #[test]
    fn checkin_inside_tolerance_is_on_time() {
        let label = classifier().classify(Some(&window()), Some(local(8, 35)), Some(local(12, 5)));
        assert_eq!(label, ParticipationLabel::OnTime);
    }

    #[test]
    fn checkin_after_tolerance_is_late() {
        let label = classifier().classify(Some(&window()), Some(local(9, 45)), Some(local(12, 5)));
        assert_eq!(label, ParticipationLabel::Late);
    }

    #[test]
    fn boundaries_are_inclusive() {
        let c = classifier();
        assert_eq!(c.bucket(&window(), local(8, 30)), CheckinBucket::OnTime);
        assert_eq!(c.bucket(&window(), local(9, 30)), CheckinBucket::OnTime);
        assert_eq!(c.bucket(&window(), local(8, 29)), CheckinBucket::Late);
        assert_eq!(c.bucket(&window(), local(9, 31)), CheckinBucket::Late);
    }

    #[test]
    fn partial_pairs() {
        let c = classifier();
        assert_eq!(
            c.classify(Some(&window()), Some(local(9, 0)), None),
            ParticipationLabel::CheckinOnly
        );
        assert_eq!(
            c.classify(Some(&window()), None, Some(local(12, 0))),
            ParticipationLabel::Absent
        );
        assert_eq!(c.classify(Some(&window()), None, None), ParticipationLabel::Absent);
        assert_eq!(
            c.classify(None, Some(local(9, 0)), Some(local(12, 0))),
            ParticipationLabel::NoWindow
        );
    }

    proptest! {
        #[test]
        fn label_depends_only_on_offset_from_start(offset in -180i64..180, stay in 1i64..240) {
            let c = classifier();
            let checkin = local(9, 0) + Duration::minutes(offset);
            let checkout = checkin + Duration::minutes(stay);
            let label = c.classify(Some(&window()), Some(checkin), Some(checkout));
            let expected = if offset.abs() <= 30 {
                ParticipationLabel::OnTime
            } else {
                ParticipationLabel::Late
            };
            prop_assert_eq!(label, expected);
        }
    }
}
