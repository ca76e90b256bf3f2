use crate::planner::Quality;

pub const MASTER_CODECS: &str = "avc1.640028,mp4a.40.2";

/// One `#EXT-X-STREAM-INF` entry of the master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    pub label: Quality,
    pub bandwidth: u64,
    pub width: u32,
    pub height: u32,
}

impl VariantEntry {
    pub fn uri(&self) -> String {
        format!("{}/playlist.m3u8", self.label)
    }
}

/// Renders the master playlist with variants in ascending bandwidth order.
pub fn render_master(entries: &[VariantEntry]) -> String {
    let mut sorted: Vec<&VariantEntry> = entries.iter().collect();
    sorted.sort_by_key(|entry| (entry.bandwidth, entry.label));

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n");
    for entry in sorted {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},CODECS=\"{}\"\n",
            entry.bandwidth, entry.width, entry.height, MASTER_CODECS
        ));
        out.push_str(&entry.uri());
        out.push('\n');
    }
    out
}

/// A variant as read back from a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterVariant {
    pub bandwidth: u64,
    pub resolution: String,
    pub uri: String,
}

pub fn parse_master(contents: &str) -> Result<Vec<MasterVariant>, String> {
    let mut lines = contents.lines().map(str::trim).filter(|line| !line.is_empty());
    if lines.next() != Some("#EXTM3U") {
        return Err("missing #EXTM3U header".into());
    }
    let mut variants = Vec::new();
    let mut pending: Option<(u64, String)> = None;
    for line in lines {
        if let Some(attributes) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let mut bandwidth = None;
            let mut resolution = String::new();
            for attribute in split_attributes(attributes) {
                match attribute.split_once('=') {
                    Some(("BANDWIDTH", value)) => {
                        bandwidth = Some(value.parse().map_err(|_| "invalid BANDWIDTH")?)
                    }
                    Some(("RESOLUTION", value)) => resolution = value.to_string(),
                    _ => {}
                }
            }
            let bandwidth = bandwidth.ok_or("STREAM-INF without BANDWIDTH")?;
            pending = Some((bandwidth, resolution));
        } else if line.starts_with('#') {
            continue;
        } else if let Some((bandwidth, resolution)) = pending.take() {
            variants.push(MasterVariant {
                bandwidth,
                resolution,
                uri: line.to_string(),
            });
        } else {
            return Err(format!("uri {line} without STREAM-INF"));
        }
    }
    Ok(variants)
}

/// Splits on commas that are not inside a quoted value.
fn split_attributes(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (index, ch) in raw.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&raw[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: Quality, bandwidth: u64, width: u32, height: u32) -> VariantEntry {
        VariantEntry {
            label,
            bandwidth,
            width,
            height,
        }
    }

    #[test]
    fn renders_exact_master_format() {
        let master = render_master(&[
            entry(Quality::P720, 2_890_800, 1280, 720),
            entry(Quality::P360, 730_400, 640, 360),
        ]);
        assert_eq!(
            master,
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-STREAM-INF:BANDWIDTH=730400,RESOLUTION=640x360,CODECS=\"avc1.640028,mp4a.40.2\"\n\
             360p/playlist.m3u8\n\
             #EXT-X-STREAM-INF:BANDWIDTH=2890800,RESOLUTION=1280x720,CODECS=\"avc1.640028,mp4a.40.2\"\n\
             720p/playlist.m3u8\n"
        );
    }

    #[test]
    fn parse_reads_back_rendered_variants() {
        let master = render_master(&[
            entry(Quality::P1080, 5_711_200, 1920, 1080),
            entry(Quality::P480, 1_205_600, 854, 480),
        ]);
        let variants = parse_master(&master).unwrap();
        assert_eq!(variants.len(), 2);
        assert_eq!(variants[0].uri, "480p/playlist.m3u8");
        assert_eq!(variants[0].resolution, "854x480");
        assert!(variants.windows(2).all(|pair| pair[0].bandwidth <= pair[1].bandwidth));
    }

    #[test]
    fn parse_rejects_orphan_uri() {
        assert!(parse_master("#EXTM3U\n360p/playlist.m3u8\n").is_err());
        assert!(parse_master("360p/playlist.m3u8\n").is_err());
    }
}
