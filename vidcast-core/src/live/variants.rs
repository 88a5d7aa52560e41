use serde::Serialize;

#[derive(Debug, Clone, Copy)]
pub struct VariantSpec {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
}

/// Fixed ladder advertised for every live stream, highest first.
pub const VARIANT_CATALOG: [VariantSpec; 4] = [
    VariantSpec {
        name: "1080p",
        width: 1920,
        height: 1080,
        bitrate_kbps: 5000,
    },
    VariantSpec {
        name: "720p",
        width: 1280,
        height: 720,
        bitrate_kbps: 2800,
    },
    VariantSpec {
        name: "480p",
        width: 854,
        height: 480,
        bitrate_kbps: 1400,
    },
    VariantSpec {
        name: "360p",
        width: 640,
        height: 360,
        bitrate_kbps: 800,
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityVariant {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bitrate_kbps: u32,
    pub playlist_url: String,
}

pub fn quality_variants(public_base_url: &str, stream_key: &str) -> Vec<QualityVariant> {
    let base = public_base_url.trim_end_matches('/');
    VARIANT_CATALOG
        .iter()
        .map(|variant| QualityVariant {
            name: variant.name.to_string(),
            width: variant.width,
            height: variant.height,
            bitrate_kbps: variant.bitrate_kbps,
            playlist_url: format!("{base}/{stream_key}/{}/index.m3u8", variant.name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variants_derive_urls_from_key() {
        let variants = quality_variants("https://live.example/hls/", "abc");
        let names: Vec<&str> = variants.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, ["1080p", "720p", "480p", "360p"]);
        assert_eq!(
            variants[2].playlist_url,
            "https://live.example/hls/abc/480p/index.m3u8"
        );
    }
}
