use std::path::Path;

/// Parsed HLS media playlist as written by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub version: u32,
    pub target_duration: f64,
    pub playlist_type: Option<String>,
    pub ended: bool,
    pub segments: Vec<MediaSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub duration: f64,
    pub uri: String,
}

impl MediaPlaylist {
    pub fn parse(contents: &str) -> Result<Self, String> {
        if !contents.trim_start().starts_with("#EXTM3U") {
            return Err("missing #EXTM3U header".into());
        }
        let mut version = 3u32;
        let mut target_duration = 0.0f64;
        let mut playlist_type = None;
        let mut ended = false;
        let mut segments = Vec::new();
        let mut pending_duration: Option<f64> = None;
        for line in contents.lines().map(str::trim) {
            if let Some(value) = line.strip_prefix("#EXT-X-VERSION:") {
                version = value.parse().map_err(|_| "invalid EXT-X-VERSION")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                target_duration = value
                    .parse()
                    .map_err(|_| "invalid EXT-X-TARGETDURATION")?;
            } else if let Some(value) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
                playlist_type = Some(value.to_string());
            } else if line == "#EXT-X-ENDLIST" {
                ended = true;
            } else if let Some(value) = line.strip_prefix("#EXTINF:") {
                let duration = value
                    .split(',')
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .parse()
                    .map_err(|_| "invalid EXTINF duration")?;
                pending_duration = Some(duration);
            } else if line.starts_with('#') || line.is_empty() {
                continue;
            } else if let Some(duration) = pending_duration.take() {
                segments.push(MediaSegment {
                    duration,
                    uri: line.to_string(),
                });
            } else {
                return Err(format!("segment {line} has no EXTINF"));
            }
        }
        Ok(Self {
            version,
            target_duration,
            playlist_type,
            ended,
            segments,
        })
    }

    /// Reads the playlist in `dir` and checks that it is complete and that
    /// every segment it names was written next to it.
    pub async fn verify(dir: &Path, playlist_name: &str) -> Result<Self, String> {
        let playlist_path = dir.join(playlist_name);
        let contents = tokio::fs::read_to_string(&playlist_path)
            .await
            .map_err(|err| format!("playlist {} unreadable: {err}", playlist_path.display()))?;
        let playlist = Self::parse(&contents)?;
        if !playlist.ended {
            return Err("truncated playlist: missing #EXT-X-ENDLIST".into());
        }
        if playlist.segments.is_empty() {
            return Err("playlist references no segments".into());
        }
        for segment in &playlist.segments {
            if segment.uri.contains('/') || segment.uri.contains("..") {
                return Err(format!("segment {} escapes the rendition directory", segment.uri));
            }
            let metadata = tokio::fs::metadata(dir.join(&segment.uri))
                .await
                .map_err(|_| format!("segment {} missing", segment.uri))?;
            if !metadata.is_file() {
                return Err(format!("segment {} is not a file", segment.uri));
            }
        }
        Ok(playlist)
    }

    pub fn average_segment_seconds(&self) -> f64 {
        if self.segments.is_empty() {
            return 0.0;
        }
        self.segments.iter().map(|segment| segment.duration).sum::<f64>()
            / self.segments.len() as f64
    }
}
