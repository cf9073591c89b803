//! HLS playlist assembly.
//!
//! Master playlists are tiny and regenerated on the fly; variant playlists
//! are rebuilt from the segment listing when the cached copy expires. All
//! renditions are audio-only AAC, hence the fixed codec string.

pub const AAC_CODEC: &str = "mp4a.40.2";

/// Fallback recommendation when no signal is available.
const DEFAULT_BITRATE: u32 = 128;

/// Build a master playlist enumerating `bitrates` (ascending). When
/// `recommended` matches a listed bitrate its variant is annotated with
/// `RESOLUTION=0x0` so clients can spot the server's pick.
pub fn master_playlist(bitrates: &[u32], recommended: Option<u32>) -> String {
    let mut sorted: Vec<u32> = bitrates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n\n");
    for bitrate in sorted {
        let bandwidth = bitrate as u64 * 1000;
        if recommended == Some(bitrate) {
            playlist.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"{}\",RESOLUTION=0x0\n",
                bandwidth, AAC_CODEC
            ));
        } else {
            playlist.push_str(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},CODECS=\"{}\"\n",
                bandwidth, AAC_CODEC
            ));
        }
        playlist.push_str(&format!("{}k/playlist.m3u8\n", bitrate));
    }
    playlist
}

/// Build a complete (VOD) variant playlist from sorted segment names.
pub fn variant_playlist(segment_names: &[String], target_duration: u32) -> String {
    let mut playlist = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:{}\n\n",
        target_duration
    );
    for name in segment_names {
        playlist.push_str(&format!("#EXTINF:{:.1},\n", target_duration as f32));
        playlist.push_str(name);
        playlist.push('\n');
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

/// Pick the variant to recommend: an explicitly preferred bitrate wins,
/// then the highest rendition fitting the client's bandwidth (lowest when
/// nothing fits), then the median of what's available.
pub fn select_recommended(
    available: &[u32],
    preferred: Option<u32>,
    client_bandwidth: Option<u64>,
) -> u32 {
    let mut sorted: Vec<u32> = available.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    if sorted.is_empty() {
        return DEFAULT_BITRATE;
    }

    if let Some(preferred) = preferred {
        if sorted.contains(&preferred) {
            return preferred;
        }
    }

    if let Some(bandwidth) = client_bandwidth {
        return sorted
            .iter()
            .rev()
            .find(|b| **b as u64 * 1000 <= bandwidth)
            .copied()
            .unwrap_or(sorted[0]);
    }

    sorted[sorted.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_lists_variants_ascending_with_bandwidth() {
        let playlist = master_playlist(&[256, 64, 128], None);
        let lines: Vec<&str> = playlist.lines().collect();
        assert_eq!(lines[0], "#EXTM3U");
        assert_eq!(lines[1], "#EXT-X-VERSION:3");
        assert_eq!(lines[3], "#EXT-X-STREAM-INF:BANDWIDTH=64000,CODECS=\"mp4a.40.2\"");
        assert_eq!(lines[4], "64k/playlist.m3u8");
        assert_eq!(lines[5], "#EXT-X-STREAM-INF:BANDWIDTH=128000,CODECS=\"mp4a.40.2\"");
        assert_eq!(lines[7], "#EXT-X-STREAM-INF:BANDWIDTH=256000,CODECS=\"mp4a.40.2\"");
    }

    #[test]
    fn master_marks_recommended_variant() {
        let playlist = master_playlist(&[64, 128, 256], Some(128));
        assert!(playlist.contains(
            "#EXT-X-STREAM-INF:BANDWIDTH=128000,CODECS=\"mp4a.40.2\",RESOLUTION=0x0\n128k/playlist.m3u8"
        ));
        // Only the recommended variant carries the marker.
        assert_eq!(playlist.matches("RESOLUTION=0x0").count(), 1);
    }

    #[test]
    fn variant_terminates_with_endlist() {
        let segments = vec!["segment_000.ts".to_string(), "segment_001.ts".to_string()];
        let playlist = variant_playlist(&segments, 10);
        assert!(playlist.starts_with("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n"));
        assert!(playlist.contains("#EXTINF:10.0,\nsegment_000.ts\n"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }

    #[test]
    fn preferred_bitrate_wins_when_available() {
        assert_eq!(select_recommended(&[64, 128, 256], Some(256), Some(100_000)), 256);
    }

    #[test]
    fn bandwidth_selects_highest_fitting_variant() {
        // 150 kbps budget fits 128k but not 256k.
        assert_eq!(select_recommended(&[64, 128, 256], None, Some(150_000)), 128);
    }

    #[test]
    fn bandwidth_below_everything_selects_lowest() {
        assert_eq!(select_recommended(&[64, 128, 256], None, Some(10_000)), 64);
    }

    #[test]
    fn no_signal_selects_median() {
        assert_eq!(select_recommended(&[64, 128, 256], None, None), 128);
        assert_eq!(select_recommended(&[64, 128], None, None), 128);
    }

    #[test]
    fn empty_availability_falls_back() {
        assert_eq!(select_recommended(&[], Some(64), None), 128);
    }
}
