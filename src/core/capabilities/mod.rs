// src/core/capabilities/mod.rs

//! The capability document model: what a remote endpoint advertises it can
//! do, in a normalised form the merger and the job dispatcher operate on.

pub mod merge;

pub use merge::{Constraint, MergeOutcome, merge_capabilities};

use std::collections::{BTreeMap, BTreeSet};

/// IPP print-quality enum values.
pub const QUALITY_DRAFT: i32 = 3;
pub const QUALITY_NORMAL: i32 = 4;
pub const QUALITY_HIGH: i32 = 5;

/// A print resolution in dots per inch. The derived ordering (x ascending,
/// then y ascending) is the comparator used when merging resolution lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resolution {
    pub x: i32,
    pub y: i32,
}

impl Resolution {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// String form as used in job options and descriptor defaults.
    pub fn to_dpi_string(&self) -> String {
        if self.x == self.y {
            format!("{}dpi", self.x)
        } else {
            format!("{}x{}dpi", self.x, self.y)
        }
    }

    pub fn parse_dpi(s: &str) -> Option<Self> {
        let s = s.strip_suffix("dpi").unwrap_or(s);
        if let Some((x, y)) = s.split_once('x') {
            Some(Self::new(x.parse().ok()?, y.parse().ok()?))
        } else {
            let v: i32 = s.parse().ok()?;
            Some(Self::new(v, v))
        }
    }
}

/// A media size in hundredths of millimetres (PWG units).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaSize {
    pub width: i32,
    pub length: i32,
}

/// Well-known PWG self-describing names for common sizes. Sizes not in the
/// table get a custom name derived from their dimensions.
const KNOWN_SIZES: &[(i32, i32, &str)] = &[
    (21000, 29700, "iso_a4_210x297mm"),
    (14800, 21000, "iso_a5_148x210mm"),
    (29700, 42000, "iso_a3_297x420mm"),
    (17600, 25000, "jis_b5_176x250mm"),
    (21590, 27940, "na_letter_8.5x11in"),
    (21590, 35560, "na_legal_8.5x14in"),
    (27940, 43180, "na_ledger_11x17in"),
    (10160, 15240, "na_index-4x6_4x6in"),
    (12700, 17780, "na_5x7_5x7in"),
    (11000, 22000, "iso_dl_110x220mm"),
    (10477, 24130, "na_number-10_4.125x9.5in"),
];

impl MediaSize {
    pub fn new(width: i32, length: i32) -> Self {
        Self { width, length }
    }

    /// The PWG self-describing media name for this size.
    pub fn pwg_name(&self) -> String {
        for (w, l, name) in KNOWN_SIZES {
            if *w == self.width && *l == self.length {
                return (*name).to_string();
            }
        }
        format!(
            "custom_{}x{}mm_{}x{}mm",
            self.width / 100,
            self.length / 100,
            self.width / 100,
            self.length / 100
        )
    }

    pub fn from_pwg_name(name: &str) -> Option<Self> {
        KNOWN_SIZES
            .iter()
            .find(|(_, _, n)| *n == name || name.strip_suffix(".borderless") == Some(n))
            .map(|(w, l, _)| Self::new(*w, *l))
    }
}

/// A continuous range of supported media sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaSizeRange {
    pub min_width: i32,
    pub max_width: i32,
    pub min_length: i32,
    pub max_length: i32,
}

impl MediaSizeRange {
    pub fn contains(&self, size: MediaSize) -> bool {
        size.width >= self.min_width
            && size.width <= self.max_width
            && size.length >= self.min_length
            && size.length <= self.max_length
    }
}

/// One `media-col-database` entry: a size with its margins, source, and type.
/// The derived ordering is the merge comparator `(w, h, margins, source, type)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MediaColEntry {
    pub width: i32,
    pub length: i32,
    pub bottom_margin: i32,
    pub left_margin: i32,
    pub right_margin: i32,
    pub top_margin: i32,
    pub source: String,
    pub media_type: String,
}

/// Sets of advertised hardware margins, one per edge, in hundredths of mm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarginSets {
    pub bottom: BTreeSet<i32>,
    pub left: BTreeSet<i32>,
    pub right: BTreeSet<i32>,
    pub top: BTreeSet<i32>,
}

/// Keyword-list capability attribute names carried in [`Capabilities::lists`].
pub const KW_MEDIA_SOURCE: &str = "media-source";
pub const KW_MEDIA_TYPE: &str = "media-type";
pub const KW_OUTPUT_BIN: &str = "output-bin";
pub const KW_COLOR_MODE: &str = "print-color-mode";
pub const KW_SIDES: &str = "sides";
pub const KW_CONTENT_OPTIMIZE: &str = "print-content-optimize";
pub const KW_RENDERING_INTENT: &str = "print-rendering-intent";
pub const KW_SCALING: &str = "print-scaling";

/// Default-capable attribute names carried in [`Capabilities::defaults`].
pub const DEFAULT_KEYWORDS: &[&str] = &[
    "media",
    "media-col",
    KW_COLOR_MODE,
    KW_OUTPUT_BIN,
    "printer-resolution",
    KW_SIDES,
    KW_CONTENT_OPTIMIZE,
    KW_RENDERING_INTENT,
    KW_SCALING,
];

/// The normalised capability document of one remote endpoint.
///
/// All collections are ordered so that the merged document is byte-stable:
/// merging the same member set twice yields an identical result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capabilities {
    pub make_model: String,
    pub color: bool,
    pub duplex: bool,
    /// Advertised pages-per-minute; 0 when the endpoint does not publish one.
    pub throughput: i32,
    /// Accepted document formats, most preferred first.
    pub pdl: Vec<String>,
    /// Keyword-list capabilities keyed by attribute name.
    pub lists: BTreeMap<String, BTreeSet<String>>,
    pub resolutions: BTreeSet<Resolution>,
    pub media_sizes: BTreeSet<MediaSize>,
    pub media_ranges: BTreeSet<MediaSizeRange>,
    pub media_cols: BTreeSet<MediaColEntry>,
    /// IPP finishings enum values.
    pub finishings: BTreeSet<i32>,
    /// IPP print-quality enum values.
    pub qualities: BTreeSet<i32>,
    pub finishing_templates: BTreeSet<String>,
    pub margins: MarginSets,
    /// Explicit `xxx-default` values by attribute name, in string form.
    pub defaults: BTreeMap<String, String>,
}

impl Capabilities {
    /// The supported value set for a named capability, in the uniform string
    /// form used for conflict generation and job matching. `media` expands to
    /// PWG size names, `printer-resolution` to dpi strings.
    pub fn supported_values(&self, keyword: &str) -> BTreeSet<String> {
        match keyword {
            "media" => self.media_sizes.iter().map(|s| s.pwg_name()).collect(),
            "printer-resolution" => self
                .resolutions
                .iter()
                .map(|r| r.to_dpi_string())
                .collect(),
            "finishing-template" => self.finishing_templates.clone(),
            _ => self.lists.get(keyword).cloned().unwrap_or_default(),
        }
    }

    /// Whether the endpoint accepts the given document format. A trailing
    /// `application/octet-stream` entry accepts anything.
    pub fn accepts_format(&self, format: &str) -> bool {
        self.pdl
            .iter()
            .any(|f| f == format || f == "application/octet-stream")
    }

    /// Whether the endpoint supports a page size, either exactly, through a
    /// size range, or as the bordered base of a `.borderless` variant.
    pub fn supports_page_size(&self, name: &str) -> bool {
        let base = name.strip_suffix(".borderless").unwrap_or(name);
        if let Some(size) = MediaSize::from_pwg_name(base) {
            if self.media_sizes.contains(&size) {
                return true;
            }
            return self.media_ranges.iter().any(|r| r.contains(size));
        }
        self.media_sizes.iter().any(|s| s.pwg_name() == base)
    }

    /// Minimum supported resolution, by the `(x, y)` ordering.
    pub fn min_resolution(&self) -> Option<Resolution> {
        self.resolutions.iter().next().copied()
    }

    /// Maximum supported resolution, by the `(x, y)` ordering.
    pub fn max_resolution(&self) -> Option<Resolution> {
        self.resolutions.iter().next_back().copied()
    }

    /// The endpoint's default resolution, when it publishes one.
    pub fn default_resolution(&self) -> Option<Resolution> {
        self.defaults
            .get("printer-resolution")
            .and_then(|s| Resolution::parse_dpi(s))
    }
}

/// Reduces a keyword to the token form used inside driver descriptors:
/// alphanumerics kept, every other run of characters collapsed away with the
/// following letter upper-cased.
pub fn descriptor_token(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if upper_next {
                out.extend(c.to_uppercase());
                upper_next = false;
            } else {
                out.push(c);
            }
        } else {
            upper_next = true;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwg_name_round_trip() {
        let a4 = MediaSize::new(21000, 29700);
        assert_eq!(a4.pwg_name(), "iso_a4_210x297mm");
        assert_eq!(MediaSize::from_pwg_name("iso_a4_210x297mm"), Some(a4));
        assert_eq!(
            MediaSize::from_pwg_name("iso_a4_210x297mm.borderless"),
            Some(a4)
        );
    }

    #[test]
    fn borderless_variant_is_covered_by_bordered_size() {
        let caps = Capabilities {
            media_sizes: [MediaSize::new(21000, 29700)].into_iter().collect(),
            ..Default::default()
        };
        assert!(caps.supports_page_size("iso_a4_210x297mm.borderless"));
        assert!(!caps.supports_page_size("na_letter_8.5x11in"));
    }

    #[test]
    fn resolution_ordering_is_x_then_y() {
        let mut set = BTreeSet::new();
        set.insert(Resolution::new(600, 1200));
        set.insert(Resolution::new(300, 300));
        set.insert(Resolution::new(600, 600));
        let ordered: Vec<_> = set.into_iter().collect();
        assert_eq!(
            ordered,
            vec![
                Resolution::new(300, 300),
                Resolution::new(600, 600),
                Resolution::new(600, 1200)
            ]
        );
    }

    #[test]
    fn descriptor_token_strips_separators() {
        assert_eq!(descriptor_token("tray-1"), "Tray1");
        assert_eq!(descriptor_token("stationery-letterhead"), "StationeryLetterhead");
        assert_eq!(descriptor_token("one-sided"), "OneSided");
    }
}
