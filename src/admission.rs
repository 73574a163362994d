use crate::config::{FeedSettings, MaxAge};
use crate::history::HistoryRecord;
use crate::types::Entry;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Decides which freshly parsed entries are new and eligible for this run:
/// not already in history, and inside the configured age window. The
/// per-feed cap counts only admitted entries and preserves feed order.
pub struct AdmissionFilter;

impl AdmissionFilter {
    pub fn admit(
        entries: Vec<Entry>,
        history: &HistoryRecord,
        settings: &FeedSettings,
        now: DateTime<Utc>,
    ) -> Vec<Entry> {
        let mut admitted: Vec<Entry> = entries
            .into_iter()
            .filter(|entry| {
                if history.contains(&entry.id) {
                    debug!(link = %entry.link, "already processed, skipping");
                    return false;
                }
                if !Self::within_window(entry.published, settings.max_age.as_ref(), history, now) {
                    debug!(link = %entry.link, published = %entry.published, "outside age window");
                    return false;
                }
                true
            })
            .collect();

        if settings.max_articles > 0 && admitted.len() > settings.max_articles {
            admitted.truncate(settings.max_articles);
        }
        admitted
    }

    fn within_window(
        published: DateTime<Utc>,
        max_age: Option<&MaxAge>,
        history: &HistoryRecord,
        now: DateTime<Utc>,
    ) -> bool {
        match max_age {
            None => true,
            Some(MaxAge::Window(window)) => now - published <= *window,
            // Vacuously true until a first digest has been committed.
            Some(MaxAge::SinceLastDigest) => match history.last_digest {
                Some(last) => published > last,
                None => true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentKind, ExtractionStatus};
    use chrono::Duration;
    use uuid::Uuid;

    fn entry(n: u128, published: DateTime<Utc>) -> Entry {
        Entry {
            id: Uuid::from_u128(n),
            title: format!("entry {n}"),
            feed_name: "test".to_string(),
            link: format!("https://example.com/{n}"),
            published,
            published_uncertain: false,
            summary: String::new(),
            content: None,
            raw_content: None,
            content_kind: ContentKind::Text,
            extraction: ExtractionStatus::Pending,
        }
    }

    fn settings(max_age: Option<MaxAge>, max_articles: usize) -> FeedSettings {
        FeedSettings {
            max_age,
            max_articles,
            ..FeedSettings::default()
        }
    }

    #[test]
    fn history_dedup_drops_known_ids() {
        let now = Utc::now();
        let mut history = HistoryRecord::default();
        history.processed.insert(Uuid::from_u128(1));

        let admitted = AdmissionFilter::admit(
            vec![entry(1, now), entry(2, now)],
            &history,
            &settings(None, 0),
            now,
        );
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].id, Uuid::from_u128(2));
    }

    #[test]
    fn age_window_boundaries() {
        let now = Utc::now();
        let history = HistoryRecord::default();
        let two_days = settings(Some(MaxAge::Window(Duration::days(2))), 0);

        let admitted = AdmissionFilter::admit(
            vec![
                entry(1, now - Duration::hours(49)),
                entry(2, now - Duration::hours(47)),
            ],
            &history,
            &two_days,
            now,
        );
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].id, Uuid::from_u128(2));
    }

    #[test]
    fn since_last_digest_is_vacuous_without_history() {
        let now = Utc::now();
        let history = HistoryRecord::default();
        let s = settings(Some(MaxAge::SinceLastDigest), 0);

        let admitted = AdmissionFilter::admit(
            vec![entry(1, now - Duration::days(30))],
            &history,
            &s,
            now,
        );
        assert_eq!(admitted.len(), 1);
    }

    #[test]
    fn since_last_digest_excludes_older_entries() {
        let now = Utc::now();
        let digest_at = now - Duration::hours(12);
        let history = HistoryRecord {
            last_digest: Some(digest_at),
            ..Default::default()
        };
        let s = settings(Some(MaxAge::SinceLastDigest), 0);

        let admitted = AdmissionFilter::admit(
            vec![
                entry(1, digest_at - Duration::seconds(1)),
                entry(2, digest_at + Duration::seconds(1)),
            ],
            &history,
            &s,
            now,
        );
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].id, Uuid::from_u128(2));
    }

    #[test]
    fn cap_counts_only_admitted_entries_in_feed_order() {
        let now = Utc::now();
        let mut history = HistoryRecord::default();
        // Pre-seed the first two entries; cap must apply after dedup.
        history.processed.insert(Uuid::from_u128(1));
        history.processed.insert(Uuid::from_u128(2));

        let entries: Vec<Entry> = (1..=6).map(|n| entry(n, now)).collect();
        let admitted = AdmissionFilter::admit(entries, &history, &settings(None, 3), now);

        let ids: Vec<u128> = admitted.iter().map(|e| e.id.as_u128()).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn rerun_without_commit_is_idempotent() {
        let now = Utc::now();
        let history = HistoryRecord::default();
        let s = settings(None, 2);
        let entries: Vec<Entry> = (1..=4).map(|n| entry(n, now)).collect();

        let first = AdmissionFilter::admit(entries.clone(), &history, &s, now);
        let second = AdmissionFilter::admit(entries, &history, &s, now);
        let ids =
            |v: &[Entry]| v.iter().map(|e| e.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }
}
