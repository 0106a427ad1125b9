//! Deterministic format selection. Pure function of the catalog, the
//! requested target, and platform quirks, so it can be unit tested against
//! fixed catalogs.
//!
//! Tie-break policy: an exact height match is chosen by highest bitrate;
//! otherwise the candidate minimizing `|height - target|` wins, with the
//! higher bitrate breaking distance ties. Remaining ties keep catalog order.

use super::catalog::StreamDescriptor;
use super::quality::QualityTarget;
use crate::media::platform::PlatformQuirks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

#[derive(Debug, Clone)]
pub enum Selection {
    /// One stream satisfies the request on its own.
    Single(StreamDescriptor),
    /// Video-only stream plus a companion audio stream, to be merged.
    Pair {
        video: StreamDescriptor,
        audio: StreamDescriptor,
    },
    /// Video-only stream with no audio candidate anywhere in the catalog.
    /// The output will be silent; callers should surface a warning.
    VideoOnly(StreamDescriptor),
}

pub fn select(
    catalog: &[StreamDescriptor],
    target: QualityTarget,
    kind: StreamKind,
    quirks: &PlatformQuirks,
) -> Option<Selection> {
    match kind {
        StreamKind::Audio => best_audio(catalog).cloned().map(Selection::Single),
        StreamKind::Video => select_video(catalog, target, quirks),
    }
}

fn select_video(
    catalog: &[StreamDescriptor],
    target: QualityTarget,
    quirks: &PlatformQuirks,
) -> Option<Selection> {
    let mut candidates: Vec<&StreamDescriptor> =
        catalog.iter().filter(|d| d.has_video()).collect();
    if candidates.is_empty() {
        return None;
    }

    // Platform exclusions must never empty the candidate set on their own.
    if let Some(excluded) = quirks.excluded_video_codec {
        let filtered: Vec<&StreamDescriptor> = candidates
            .iter()
            .copied()
            .filter(|d| d.video_family() != Some(excluded))
            .collect();
        if !filtered.is_empty() {
            candidates = filtered;
        }
    }

    // Prefer streams that already carry audio; fall back to video-only and
    // pick a companion audio stream separately.
    let combined: Vec<&StreamDescriptor> = candidates
        .iter()
        .copied()
        .filter(|d| d.has_audio())
        .collect();
    let (pool, needs_audio) = if combined.is_empty() {
        (candidates, true)
    } else {
        (combined, false)
    };

    let best = pick_by_height(&pool, target)?;

    if !needs_audio {
        return Some(Selection::Single(best.clone()));
    }

    match best_audio(catalog) {
        Some(audio) => Some(Selection::Pair {
            video: best.clone(),
            audio: audio.clone(),
        }),
        None => Some(Selection::VideoOnly(best.clone())),
    }
}

fn bitrate_of(d: &StreamDescriptor) -> f32 {
    d.bitrate.unwrap_or(0.0)
}

fn pick_by_height<'a>(
    pool: &[&'a StreamDescriptor],
    target: QualityTarget,
) -> Option<&'a StreamDescriptor> {
    let with_height: Vec<&StreamDescriptor> = pool
        .iter()
        .copied()
        .filter(|d| d.height.is_some())
        .collect();

    // Last resort when nothing reports a height: bitrate is the only proxy.
    if with_height.is_empty() {
        return pool.iter().copied().reduce(|best, d| {
            if bitrate_of(d) > bitrate_of(best) {
                d
            } else {
                best
            }
        });
    }

    let exact: Vec<&StreamDescriptor> = with_height
        .iter()
        .copied()
        .filter(|d| d.height == Some(target.height))
        .collect();
    if !exact.is_empty() {
        return exact.into_iter().reduce(|best, d| {
            if bitrate_of(d) > bitrate_of(best) {
                d
            } else {
                best
            }
        });
    }

    with_height.into_iter().reduce(|best, d| {
        let best_dist = best.height.unwrap().abs_diff(target.height);
        let dist = d.height.unwrap().abs_diff(target.height);
        if dist < best_dist || (dist == best_dist && bitrate_of(d) > bitrate_of(best)) {
            d
        } else {
            best
        }
    })
}

/// Audio picks ignore height entirely: highest bitrate wins.
fn best_audio(catalog: &[StreamDescriptor]) -> Option<&StreamDescriptor> {
    catalog
        .iter()
        .filter(|d| d.has_audio())
        .reduce(|best, d| {
            if bitrate_of(d) > bitrate_of(best) {
                d
            } else {
                best
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::catalog::CodecFamily;

    fn video(id: &str, height: u32, bitrate: f32) -> StreamDescriptor {
        StreamDescriptor {
            id: id.to_string(),
            container: "mp4".to_string(),
            video_codec: Some("avc1.4d401f".to_string()),
            audio_codec: None,
            height: Some(height),
            bitrate: Some(bitrate),
            size_bytes: None,
        }
    }

    fn combined(id: &str, height: u32, bitrate: f32) -> StreamDescriptor {
        StreamDescriptor {
            audio_codec: Some("mp4a.40.2".to_string()),
            ..video(id, height, bitrate)
        }
    }

    fn audio(id: &str, codec: &str, bitrate: f32) -> StreamDescriptor {
        StreamDescriptor {
            id: id.to_string(),
            container: "m4a".to_string(),
            video_codec: None,
            audio_codec: Some(codec.to_string()),
            height: None,
            bitrate: Some(bitrate),
            size_bytes: None,
        }
    }

    fn target(height: u32) -> QualityTarget {
        QualityTarget { height }
    }

    fn picked_id(selection: Option<Selection>) -> String {
        match selection.unwrap() {
            Selection::Single(d) | Selection::VideoOnly(d) => d.id,
            Selection::Pair { video, .. } => video.id,
        }
    }

    #[test]
    fn test_exact_height_match() {
        let catalog = vec![
            combined("a", 480, 800.0),
            combined("b", 720, 1500.0),
            combined("c", 1080, 3000.0),
        ];
        let sel = select(&catalog, target(720), StreamKind::Video, &Default::default());
        assert_eq!(picked_id(sel), "b");
    }

    #[test]
    fn test_nearest_height_wins() {
        // 480 is 240 away from 720, 1080 is 360 away.
        let catalog = vec![combined("a", 480, 800.0), combined("b", 1080, 3000.0)];
        let sel = select(&catalog, target(720), StreamKind::Video, &Default::default());
        assert_eq!(picked_id(sel), "a");
    }

    #[test]
    fn test_exact_ties_resolve_by_bitrate() {
        let catalog = vec![combined("low", 720, 1000.0), combined("high", 720, 2500.0)];
        let sel = select(&catalog, target(720), StreamKind::Video, &Default::default());
        assert_eq!(picked_id(sel), "high");
    }

    #[test]
    fn test_distance_ties_resolve_by_bitrate() {
        // 480 and 960 are both 240 away from 720.
        let catalog = vec![combined("a", 480, 800.0), combined("b", 960, 2000.0)];
        let sel = select(&catalog, target(720), StreamKind::Video, &Default::default());
        assert_eq!(picked_id(sel), "b");
    }

    #[test]
    fn test_audio_highest_bitrate() {
        let catalog = vec![audio("a", "mp3", 128.0), audio("b", "opus", 256.0)];
        let sel = select(&catalog, target(720), StreamKind::Audio, &Default::default());
        assert_eq!(picked_id(sel), "b");
    }

    #[test]
    fn test_combined_preferred_over_video_only() {
        let catalog = vec![video("vo", 720, 4000.0), combined("cb", 720, 1500.0)];
        let sel = select(&catalog, target(720), StreamKind::Video, &Default::default());
        assert!(matches!(sel, Some(Selection::Single(ref d)) if d.id == "cb"));
    }

    #[test]
    fn test_video_only_pairs_with_audio() {
        let catalog = vec![video("v", 1080, 3000.0), audio("a", "opus", 160.0)];
        let sel = select(&catalog, target(1080), StreamKind::Video, &Default::default());
        match sel {
            Some(Selection::Pair { video, audio }) => {
                assert_eq!(video.id, "v");
                assert_eq!(audio.id, "a");
            }
            other => panic!("expected pair, got {:?}", other),
        }
    }

    #[test]
    fn test_video_only_without_audio_candidate() {
        let catalog = vec![video("v", 1080, 3000.0)];
        let sel = select(&catalog, target(1080), StreamKind::Video, &Default::default());
        assert!(matches!(sel, Some(Selection::VideoOnly(ref d)) if d.id == "v"));
    }

    #[test]
    fn test_exclusion_drops_codec_family() {
        let mut hevc = combined("hevc", 720, 2000.0);
        hevc.video_codec = Some("hev1.1.6".to_string());
        let catalog = vec![hevc, combined("h264", 720, 1500.0)];
        let quirks = PlatformQuirks {
            excluded_video_codec: Some(CodecFamily::Hevc),
            ..Default::default()
        };
        let sel = select(&catalog, target(720), StreamKind::Video, &quirks);
        assert_eq!(picked_id(sel), "h264");
    }

    #[test]
    fn test_exclusion_never_empties_the_set() {
        let mut hevc = combined("hevc", 720, 2000.0);
        hevc.video_codec = Some("hev1.1.6".to_string());
        let catalog = vec![hevc];
        let quirks = PlatformQuirks {
            excluded_video_codec: Some(CodecFamily::Hevc),
            ..Default::default()
        };
        let sel = select(&catalog, target(720), StreamKind::Video, &quirks);
        assert_eq!(picked_id(sel), "hevc");
    }

    #[test]
    fn test_heightless_pool_uses_bitrate_proxy() {
        let mut a = combined("a", 0, 900.0);
        a.height = None;
        let mut b = combined("b", 0, 1800.0);
        b.height = None;
        let catalog = vec![a, b];
        let sel = select(&catalog, target(720), StreamKind::Video, &Default::default());
        assert_eq!(picked_id(sel), "b");
    }

    #[test]
    fn test_empty_catalog() {
        assert!(select(&[], target(720), StreamKind::Video, &Default::default()).is_none());
        assert!(select(&[], target(720), StreamKind::Audio, &Default::default()).is_none());
    }

    #[test]
    fn test_audio_kind_ignores_video_only_streams() {
        let catalog = vec![video("v", 720, 5000.0), audio("a", "mp3", 96.0)];
        let sel = select(&catalog, target(720), StreamKind::Audio, &Default::default());
        assert_eq!(picked_id(sel), "a");
    }

    #[test]
    fn test_deterministic() {
        let catalog = vec![
            combined("a", 480, 800.0),
            combined("b", 720, 1500.0),
            video("c", 1080, 3000.0),
            audio("d", "opus", 160.0),
        ];
        let first = picked_id(select(
            &catalog,
            target(720),
            StreamKind::Video,
            &Default::default(),
        ));
        for _ in 0..10 {
            let again = picked_id(select(
                &catalog,
                target(720),
                StreamKind::Video,
                &Default::default(),
            ));
            assert_eq!(first, again);
        }
    }
}
