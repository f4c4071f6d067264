use ffmpeg::codec::{self, encoder};

/// A compressed video format and the libavcodec encoders that produce it,
/// in order of preference.
pub struct CodecFamily {
    pub mime: &'static str,
    pub id: codec::Id,
    pub aliases: &'static [&'static str],
    pub encoders: &'static [&'static str],
    /// Whether the stream carries out-of-band parameter sets. Families
    /// without them get their container track before any output arrives.
    pub codec_config: bool,
}

pub const FAMILIES: &[CodecFamily] = &[
    CodecFamily {
        mime: "video/avc",
        id: codec::Id::H264,
        aliases: &["avc", "h264"],
        encoders: &[
            "h264_nvenc",
            "h264_qsv",
            "h264_videotoolbox",
            "h264_mf",
            "h264_vaapi",
            "libx264",
        ],
        codec_config: true,
    },
    CodecFamily {
        mime: "video/hevc",
        id: codec::Id::HEVC,
        aliases: &["hevc", "h265"],
        encoders: &[
            "hevc_nvenc",
            "hevc_qsv",
            "hevc_videotoolbox",
            "hevc_mf",
            "hevc_amf",
            "libx265",
        ],
        codec_config: true,
    },
    CodecFamily {
        mime: "video/x-vnd.on2.vp8",
        id: codec::Id::VP8,
        aliases: &["vp8"],
        encoders: &["vp8_vaapi", "libvpx"],
        codec_config: false,
    },
    CodecFamily {
        mime: "video/x-vnd.on2.vp9",
        id: codec::Id::VP9,
        aliases: &["vp9"],
        encoders: &["vp9_qsv", "vp9_vaapi", "libvpx-vp9"],
        codec_config: false,
    },
    CodecFamily {
        mime: "video/av01",
        id: codec::Id::AV1,
        aliases: &["av1"],
        encoders: &["av1_nvenc", "av1_qsv", "libsvtav1", "libaom-av1"],
        codec_config: false,
    },
];

pub fn family_for_mime(mime: &str) -> Option<&'static CodecFamily> {
    FAMILIES.iter().find(|f| f.mime.eq_ignore_ascii_case(mime))
}

pub fn family_for_alias(alias: &str) -> Option<&'static CodecFamily> {
    let alias = alias.to_ascii_lowercase();
    FAMILIES.iter().find(|f| f.aliases.contains(&alias.as_str()))
}

pub fn family_for_id(id: codec::Id) -> Option<&'static CodecFamily> {
    FAMILIES.iter().find(|f| f.id == id)
}

/// Encoders whose work happens off the CPU.
pub fn is_hardware(name: &str) -> bool {
    ["_nvenc", "_qsv", "_videotoolbox", "_mf", "_vaapi", "_amf"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// First encoder of `family` this libavcodec build provides.
pub fn first_available(family: &CodecFamily) -> Option<&'static str> {
    family
        .encoders
        .iter()
        .copied()
        .find(|name| encoder::find_by_name(name).is_some())
}
