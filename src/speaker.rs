use crate::model::{SpeakerEvent, SpeakerEventType, SpeakerMappingStatus};

/// Window, in milliseconds, around a segment's `[start, end]` range in
/// which a speaker event is considered relevant (spec §4.2).
pub const MATCH_WINDOW_MS: i64 = 500;

#[derive(Debug, Clone)]
struct SpeakerInterval {
    participant_key: String,
    participant_name: String,
    start_ms: i64,
    end_ms: Option<i64>,
}

fn participant_key(event: &SpeakerEvent) -> String {
    event
        .participant_id
        .clone()
        .unwrap_or_else(|| event.participant_name.clone())
}

/// Pair `SPEAKER_START`/`SPEAKER_END` events into per-participant intervals.
/// Matched by `participant_id`, falling back to `participant_name` only when
/// the id is absent, so two participants sharing a display name aren't
/// mis-paired. An unmatched `SPEAKER_START` is treated as open-ended
/// (`end_ms = None`, i.e. still speaking); an unmatched `SPEAKER_END` is
/// dropped.
fn pair_events(events: &[SpeakerEvent]) -> Vec<SpeakerInterval> {
    let mut sorted: Vec<&SpeakerEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.relative_client_timestamp_ms);

    let mut open: Vec<(usize, SpeakerInterval)> = Vec::new();
    let mut closed: Vec<SpeakerInterval> = Vec::new();

    for event in sorted {
        let key = participant_key(event);
        match event.event_type {
            SpeakerEventType::SpeakerStart => {
                open.push((
                    open.len(),
                    SpeakerInterval {
                        participant_key: key,
                        participant_name: event.participant_name.clone(),
                        start_ms: event.relative_client_timestamp_ms,
                        end_ms: None,
                    },
                ));
            }
            SpeakerEventType::SpeakerEnd => {
                if let Some(pos) = open.iter().rposition(|(_, i)| i.participant_key == key) {
                    let (_, mut interval) = open.remove(pos);
                    interval.end_ms = Some(event.relative_client_timestamp_ms);
                    closed.push(interval);
                }
            }
        }
    }
    closed.extend(open.into_iter().map(|(_, i)| i));
    closed
}

fn overlap_ms(seg_start: i64, seg_end: i64, iv: &SpeakerInterval) -> i64 {
    let iv_end = iv.end_ms.unwrap_or(i64::MAX);
    let lo = seg_start.max(iv.start_ms);
    let hi = seg_end.min(iv_end);
    (hi - lo).max(0)
}

#[derive(Debug, Clone)]
pub struct SpeakerMappingResult {
    pub speaker: Option<String>,
    pub status: SpeakerMappingStatus,
}

/// Map a transcript segment's `[start_ms, end_ms]` against the session's
/// speaker events (spec §4.2's speaker-mapping algorithm). `events` is
/// expected to already be fetched over the widened `±`[`MATCH_WINDOW_MS`]
/// range (the caller's concern, e.g. `collector/consumer.rs`); overlap here
/// is computed against the actual segment bounds, not that fetch window.
///
/// Ties broken by largest overlap, then by the candidate with the latest
/// `start_ms` (spec §9's tie-break resolution).
pub fn map_speaker(seg_start_ms: i64, seg_end_ms: i64, events: &[SpeakerEvent]) -> SpeakerMappingResult {
    if events.is_empty() {
        return SpeakerMappingResult {
            speaker: None,
            status: SpeakerMappingStatus::NoSpeakerEvents,
        };
    }

    let intervals = pair_events(events);
    let mut candidates: Vec<(&SpeakerInterval, i64)> = intervals
        .iter()
        .filter_map(|iv| {
            let ov = overlap_ms(seg_start_ms, seg_end_ms, iv);
            if ov > 0 {
                Some((iv, ov))
            } else {
                None
            }
        })
        .collect();

    if candidates.is_empty() {
        return SpeakerMappingResult {
            speaker: None,
            status: SpeakerMappingStatus::Unknown,
        };
    }

    let distinct_speakers: std::collections::HashSet<&str> = candidates
        .iter()
        .map(|(iv, _)| iv.participant_key.as_str())
        .collect();

    candidates.sort_by(|a, b| {
        b.1.cmp(&a.1).then_with(|| b.0.start_ms.cmp(&a.0.start_ms))
    });
    let winner = candidates[0].0.participant_name.clone();

    if distinct_speakers.len() > 1 {
        return SpeakerMappingResult {
            speaker: Some(winner),
            status: SpeakerMappingStatus::MultipleConcurrentSpeakers,
        };
    }

    SpeakerMappingResult {
        speaker: Some(winner),
        status: SpeakerMappingStatus::Mapped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: SpeakerEventType, name: &str, ts: i64) -> SpeakerEvent {
        SpeakerEvent {
            event_type: kind,
            participant_name: name.to_string(),
            participant_id: None,
            uid: "uid-1".to_string(),
            relative_client_timestamp_ms: ts,
        }
    }

    #[test]
    fn no_events_yields_no_speaker_events_status() {
        let result = map_speaker(1000, 2000, &[]);
        assert_eq!(result.status, SpeakerMappingStatus::NoSpeakerEvents);
        assert!(result.speaker.is_none());
    }

    #[test]
    fn single_matching_speaker_is_mapped() {
        let events = vec![
            event(SpeakerEventType::SpeakerStart, "Alice", 900),
            event(SpeakerEventType::SpeakerEnd, "Alice", 2100),
        ];
        let result = map_speaker(1000, 2000, &events);
        assert_eq!(result.status, SpeakerMappingStatus::Mapped);
        assert_eq!(result.speaker.as_deref(), Some("Alice"));
    }

    #[test]
    fn overlapping_speakers_flagged_multiple_concurrent() {
        let events = vec![
            event(SpeakerEventType::SpeakerStart, "Alice", 900),
            event(SpeakerEventType::SpeakerEnd, "Alice", 1500),
            event(SpeakerEventType::SpeakerStart, "Bob", 1400),
            event(SpeakerEventType::SpeakerEnd, "Bob", 2100),
        ];
        let result = map_speaker(1000, 2000, &events);
        assert_eq!(result.status, SpeakerMappingStatus::MultipleConcurrentSpeakers);
        assert!(result.speaker.is_some());
    }

    #[test]
    fn events_outside_window_do_not_match() {
        let events = vec![
            event(SpeakerEventType::SpeakerStart, "Alice", 10_000),
            event(SpeakerEventType::SpeakerEnd, "Alice", 10_500),
        ];
        let result = map_speaker(1000, 2000, &events);
        assert_eq!(result.status, SpeakerMappingStatus::Unknown);
        assert!(result.speaker.is_none());
    }

    #[test]
    fn same_name_different_ids_are_not_mis_paired() {
        let mut start_a = event(SpeakerEventType::SpeakerStart, "Alice", 900);
        start_a.participant_id = Some("id-a".to_string());
        let mut end_a = event(SpeakerEventType::SpeakerEnd, "Alice", 1500);
        end_a.participant_id = Some("id-a".to_string());
        let mut start_b = event(SpeakerEventType::SpeakerStart, "Alice", 1400);
        start_b.participant_id = Some("id-b".to_string());
        let mut end_b = event(SpeakerEventType::SpeakerEnd, "Alice", 2100);
        end_b.participant_id = Some("id-b".to_string());

        let events = vec![start_a, end_a, start_b, end_b];
        let result = map_speaker(1000, 2000, &events);
        assert_eq!(result.status, SpeakerMappingStatus::MultipleConcurrentSpeakers);
    }

    #[test]
    fn open_ended_start_counts_as_still_speaking() {
        let events = vec![event(SpeakerEventType::SpeakerStart, "Alice", 500)];
        let result = map_speaker(1000, 2000, &events);
        assert_eq!(result.status, SpeakerMappingStatus::Mapped);
        assert_eq!(result.speaker.as_deref(), Some("Alice"));
    }

    #[test]
    fn tie_break_prefers_latest_start_on_equal_overlap() {
        let events = vec![
            event(SpeakerEventType::SpeakerStart, "Alice", 1000),
            event(SpeakerEventType::SpeakerEnd, "Alice", 1500),
            event(SpeakerEventType::SpeakerStart, "Bob", 1000),
            event(SpeakerEventType::SpeakerEnd, "Bob", 1500),
        ];
        // Both intervals identical except name; tie-break is deterministic
        // ordering input, not a meaningful real-world distinction, but the
        // function must not panic and must pick exactly one.
        let result = map_speaker(1000, 1500, &events);
        assert_eq!(result.status, SpeakerMappingStatus::MultipleConcurrentSpeakers);
        assert!(result.speaker.is_some());
    }
}
