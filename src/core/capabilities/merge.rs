// src/core/capabilities/merge.rs

//! Merges the capability documents of all confirmed cluster members into the
//! single document advertised by the local queue, and derives the
//! capability-constraint list for the generated descriptor.

use super::{Capabilities, DEFAULT_KEYWORDS, MarginSets};
use std::collections::{BTreeMap, BTreeSet};

/// Keywords participating in constraint generation, in their fixed pair
/// order. `media` stands for the page-size choice; its region alias is
/// handled by the descriptor writer and never paired against it here.
pub const CONFLICT_KEYWORD_ORDER: &[&str] = &[
    "media",
    "media-source",
    "media-type",
    "sides",
    "print-color-mode",
    "output-bin",
    "finishing-template",
];

/// One capability constraint: selecting `value1` for `keyword1` forbids
/// `value2` for `keyword2`. Constraints are emitted in mirrored pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Constraint {
    pub keyword1: String,
    pub value1: String,
    pub keyword2: String,
    pub value2: String,
}

/// The result of a cluster merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub caps: Capabilities,
    pub constraints: BTreeSet<Constraint>,
}

/// Normalises a media source/type keyword before it participates in merge
/// comparisons: lowercased, trimmed, inner whitespace collapsed to dashes.
pub fn sanitize_media_keyword(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut dash_pending = false;
    for c in s.trim().chars() {
        if c.is_whitespace() {
            dash_pending = !out.is_empty();
        } else {
            if dash_pending {
                out.push('-');
                dash_pending = false;
            }
            out.extend(c.to_lowercase());
        }
    }
    out
}

/// Merges the capability documents of the given cluster members, in registry
/// insertion order. All output collections are ordered, so merging the same
/// member set twice yields byte-identical results.
pub fn merge_capabilities(members: &[&Capabilities]) -> MergeOutcome {
    let mut caps = Capabilities::default();

    if members.is_empty() {
        return MergeOutcome {
            caps,
            constraints: BTreeSet::new(),
        };
    }

    // The member with the highest advertised throughput provides the
    // defaults; insertion order breaks ties.
    let provider = members
        .iter()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.throughput
                .cmp(&b.throughput)
                .then(ib.cmp(ia)) // earlier index wins ties
        })
        .map(|(_, m)| *m)
        .expect("members is non-empty");

    caps.make_model = provider.make_model.clone();
    caps.color = members.iter().any(|m| m.color);
    caps.duplex = members.iter().any(|m| m.duplex);
    caps.throughput = members.iter().map(|m| m.throughput).max().unwrap_or(0);

    // Document formats keep the first member's preference order; formats only
    // some members accept are appended.
    for member in members {
        for format in &member.pdl {
            if !caps.pdl.contains(format) {
                caps.pdl.push(format.clone());
            }
        }
    }

    for member in members {
        for (keyword, values) in &member.lists {
            caps.lists
                .entry(keyword.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
        caps.resolutions.extend(member.resolutions.iter().copied());
        caps.media_sizes.extend(member.media_sizes.iter().copied());
        caps.media_ranges.extend(member.media_ranges.iter().copied());
        for col in &member.media_cols {
            let mut col = col.clone();
            col.source = sanitize_media_keyword(&col.source);
            col.media_type = sanitize_media_keyword(&col.media_type);
            caps.media_cols.insert(col);
        }
        caps.finishings.extend(member.finishings.iter().copied());
        caps.qualities.extend(member.qualities.iter().copied());
        caps.finishing_templates
            .extend(member.finishing_templates.iter().cloned());
        merge_margins(&mut caps.margins, &member.margins);
    }

    caps.defaults = merge_defaults(&caps, provider);

    let constraints = generate_constraints(&caps, members);

    MergeOutcome { caps, constraints }
}

fn merge_margins(into: &mut MarginSets, from: &MarginSets) {
    into.bottom.extend(from.bottom.iter().copied());
    into.left.extend(from.left.iter().copied());
    into.right.extend(from.right.iter().copied());
    into.top.extend(from.top.iter().copied());
}

/// Computes the merged defaults. A default comes from the canonical provider
/// when it exposes one; otherwise `auto` stands in whenever more than one
/// value remains to choose from.
fn merge_defaults(merged: &Capabilities, provider: &Capabilities) -> BTreeMap<String, String> {
    let mut defaults = BTreeMap::new();

    for keyword in DEFAULT_KEYWORDS {
        if let Some(value) = provider.defaults.get(*keyword) {
            defaults.insert((*keyword).to_string(), value.clone());
            continue;
        }

        let supported = merged_choice_count(merged, keyword);
        match supported.len() {
            0 => {}
            1 => {
                defaults.insert(
                    (*keyword).to_string(),
                    supported.iter().next().expect("len is 1").clone(),
                );
            }
            _ => {
                defaults.insert((*keyword).to_string(), "auto".to_string());
            }
        }
    }

    defaults
}

/// The choice list a default keyword selects from.
fn merged_choice_count(merged: &Capabilities, keyword: &str) -> BTreeSet<String> {
    match keyword {
        "media-col" => merged
            .media_cols
            .iter()
            .map(|c| format!("{}/{}", c.source, c.media_type))
            .collect(),
        _ => merged.supported_values(keyword),
    }
}

/// Generates the constraint list: for every ordered keyword pair and every
/// member, a value the member lacks for the first keyword conflicts with each
/// value the member has for the second, unless some member supports both.
fn generate_constraints(
    merged: &Capabilities,
    members: &[&Capabilities],
) -> BTreeSet<Constraint> {
    let mut constraints = BTreeSet::new();

    // Precompute every member's supported sets once.
    let supported: Vec<BTreeMap<&str, BTreeSet<String>>> = members
        .iter()
        .map(|m| {
            CONFLICT_KEYWORD_ORDER
                .iter()
                .map(|k| (*k, m.supported_values(k)))
                .collect()
        })
        .collect();

    for (i, k1) in CONFLICT_KEYWORD_ORDER.iter().enumerate() {
        let union1 = merged.supported_values(k1);
        for k2 in &CONFLICT_KEYWORD_ORDER[i + 1..] {
            for member_supported in &supported {
                let sup1 = &member_supported[k1];
                let sup2 = &member_supported[k2];

                for v in union1.iter() {
                    if v == "auto" || sup1.contains(v) {
                        continue;
                    }
                    for u in sup2.iter() {
                        if u == "auto" {
                            continue;
                        }
                        let feasible = supported.iter().any(|other| {
                            other[k1].contains(v) && other[k2].contains(u)
                        });
                        if feasible {
                            continue;
                        }
                        constraints.insert(Constraint {
                            keyword1: (*k1).to_string(),
                            value1: v.clone(),
                            keyword2: (*k2).to_string(),
                            value2: u.clone(),
                        });
                        constraints.insert(Constraint {
                            keyword1: (*k2).to_string(),
                            value1: u.clone(),
                            keyword2: (*k1).to_string(),
                            value2: v.clone(),
                        });
                    }
                }
            }
        }
    }

    constraints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::capabilities::{KW_MEDIA_SOURCE, MediaSize, Resolution};

    fn caps_with_sources(sources: &[&str]) -> Capabilities {
        let mut caps = Capabilities::default();
        caps.lists.insert(
            KW_MEDIA_SOURCE.to_string(),
            sources.iter().map(|s| s.to_string()).collect(),
        );
        caps
    }

    #[test]
    fn keyword_lists_union() {
        let a = caps_with_sources(&["tray-1"]);
        let b = caps_with_sources(&["tray-2"]);
        let merged = merge_capabilities(&[&a, &b]);
        assert_eq!(
            merged.caps.supported_values(KW_MEDIA_SOURCE),
            ["tray-1", "tray-2"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
    }

    #[test]
    fn merge_is_deterministic() {
        let mut a = caps_with_sources(&["tray-1", "tray-2"]);
        a.resolutions.insert(Resolution::new(600, 600));
        a.media_sizes.insert(MediaSize::new(21000, 29700));
        let b = caps_with_sources(&["tray-3"]);
        let first = merge_capabilities(&[&a, &b]);
        let second = merge_capabilities(&[&a, &b]);
        assert_eq!(first, second);
    }

    #[test]
    fn sanitize_collapses_whitespace() {
        assert_eq!(sanitize_media_keyword("  Main  Tray "), "main-tray");
    }
}
