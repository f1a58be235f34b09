// src/core/spooler/descriptor.rs

//! Driver-descriptor handling.
//!
//! Generation itself is a pure function behind [`DescriptorGenerator`]; what
//! the daemon owns is the editing applied to every generated descriptor
//! before it is installed: the data-conversion redirection, restored option
//! defaults, the remote-queue directive, and nickname capture.

use crate::core::capabilities::{Capabilities, Constraint, descriptor_token};
use crate::core::errors::BridgeError;
use std::collections::{BTreeMap, BTreeSet};

/// The line routing every job through the spooler's generic PDF path, so no
/// device-specific conversion happens locally.
const FILTER_REDIRECT_LINE: &str = "*cupsFilter2: \"application/vnd.cups-pdf application/pdf 0 -\"";

/// The directive marking the queue as backed by a remote spooler in the
/// local spooler's own bookkeeping.
const REMOTE_QUEUE_LINE: &str = "*APRemoteQueueID: \"\"";

/// Produces a driver descriptor from a merged capability set. Implemented by
/// an external library in production; the built-in generator covers the
/// attribute families this daemon merges.
pub trait DescriptorGenerator: Send + Sync {
    fn generate(
        &self,
        queue_name: &str,
        caps: &Capabilities,
        constraints: &BTreeSet<Constraint>,
    ) -> Result<String, BridgeError>;
}

/// Maps a capability keyword to its descriptor option name.
fn option_name(keyword: &str) -> Option<&'static str> {
    match keyword {
        "media" => Some("PageSize"),
        "media-source" => Some("InputSlot"),
        "media-type" => Some("MediaType"),
        "sides" => Some("Duplex"),
        "print-color-mode" => Some("ColorModel"),
        "output-bin" => Some("OutputBin"),
        "finishing-template" => Some("Finishing"),
        "printer-resolution" => Some("Resolution"),
        _ => None,
    }
}

/// Maps an IPP `sides` keyword to the conventional descriptor duplex choice.
pub fn sides_to_duplex_choice(sides: &str) -> &'static str {
    match sides {
        "two-sided-long-edge" => "DuplexNoTumble",
        "two-sided-short-edge" => "DuplexTumble",
        _ => "None",
    }
}

/// The descriptor choice token for a capability value.
fn choice_token(keyword: &str, value: &str) -> String {
    match keyword {
        "sides" => sides_to_duplex_choice(value).to_string(),
        "printer-resolution" => value.to_string(),
        _ => descriptor_token(value),
    }
}

/// The built-in generator.
#[derive(Debug, Default)]
pub struct PpdGenerator;

impl DescriptorGenerator for PpdGenerator {
    fn generate(
        &self,
        queue_name: &str,
        caps: &Capabilities,
        constraints: &BTreeSet<Constraint>,
    ) -> Result<String, BridgeError> {
        if caps.media_sizes.is_empty() && caps.media_ranges.is_empty() {
            return Err(BridgeError::DescriptorGeneration(
                queue_name.to_string(),
                "capability set advertises no media sizes".to_string(),
            ));
        }

        let nickname = if caps.make_model.is_empty() {
            queue_name.to_string()
        } else {
            caps.make_model.clone()
        };

        let mut out = String::with_capacity(4096);
        out.push_str("*PPD-Adobe: \"4.3\"\n");
        out.push_str("*FormatVersion: \"4.3\"\n");
        out.push_str("*FileVersion: \"1.0\"\n");
        out.push_str("*LanguageVersion: English\n");
        out.push_str("*LanguageEncoding: ISOLatin1\n");
        out.push_str(&format!("*PCFileName: \"{}.PPD\"\n", descriptor_token(queue_name)));
        out.push_str("*Manufacturer: \"Generic\"\n");
        out.push_str(&format!("*ModelName: \"{nickname}\"\n"));
        out.push_str(&format!("*NickName: \"{nickname}\"\n"));
        out.push_str(&format!("*ShortNickName: \"{nickname}\"\n"));
        out.push_str(&format!(
            "*ColorDevice: {}\n",
            if caps.color { "True" } else { "False" }
        ));
        out.push_str("*cupsVersion: 2.4\n");
        out.push_str("*cupsLanguages: \"en\"\n");

        write_page_sizes(&mut out, caps);
        write_keyword_option(&mut out, caps, "media-source", "InputSlot");
        write_keyword_option(&mut out, caps, "media-type", "MediaType");
        write_duplex(&mut out, caps);
        write_color_model(&mut out, caps);
        write_keyword_option(&mut out, caps, "output-bin", "OutputBin");
        write_resolutions(&mut out, caps);
        write_constraints(&mut out, constraints);

        Ok(out)
    }
}

fn write_page_sizes(out: &mut String, caps: &Capabilities) {
    let sizes: Vec<String> = caps.media_sizes.iter().map(|s| s.pwg_name()).collect();
    if sizes.is_empty() {
        return;
    }
    let default = caps
        .defaults
        .get("media")
        .map(|m| descriptor_token(m))
        .unwrap_or_else(|| descriptor_token(&sizes[0]));

    for option in ["PageSize", "PageRegion"] {
        out.push_str(&format!("*OpenUI *{option}: PickOne\n"));
        out.push_str(&format!("*Default{option}: {default}\n"));
        for size in &sizes {
            out.push_str(&format!(
                "*{option} {}: \"<</PageSize[0 0]>>setpagedevice\"\n",
                descriptor_token(size)
            ));
        }
        out.push_str(&format!("*CloseUI: *{option}\n"));
    }
}

fn write_keyword_option(out: &mut String, caps: &Capabilities, keyword: &str, option: &str) {
    let values = caps.supported_values(keyword);
    if values.is_empty() {
        return;
    }
    let default = caps
        .defaults
        .get(keyword)
        .map(|v| choice_token(keyword, v))
        .unwrap_or_else(|| choice_token(keyword, values.iter().next().expect("non-empty")));

    out.push_str(&format!("*OpenUI *{option}: PickOne\n"));
    out.push_str(&format!("*Default{option}: {default}\n"));
    for value in &values {
        out.push_str(&format!("*{option} {}: \"\"\n", choice_token(keyword, value)));
    }
    out.push_str(&format!("*CloseUI: *{option}\n"));
}

fn write_duplex(out: &mut String, caps: &Capabilities) {
    if !caps.duplex {
        return;
    }
    let default = caps
        .defaults
        .get("sides")
        .map(|s| sides_to_duplex_choice(s))
        .unwrap_or("None");
    out.push_str("*OpenUI *Duplex: PickOne\n");
    out.push_str(&format!("*DefaultDuplex: {default}\n"));
    out.push_str("*Duplex None: \"\"\n");
    out.push_str("*Duplex DuplexNoTumble: \"\"\n");
    out.push_str("*Duplex DuplexTumble: \"\"\n");
    out.push_str("*CloseUI: *Duplex\n");
}

fn write_color_model(out: &mut String, caps: &Capabilities) {
    let default = caps
        .defaults
        .get("print-color-mode")
        .map(|v| descriptor_token(v))
        .unwrap_or_else(|| {
            if caps.color {
                "Color".to_string()
            } else {
                "Monochrome".to_string()
            }
        });
    out.push_str("*OpenUI *ColorModel: PickOne\n");
    out.push_str(&format!("*DefaultColorModel: {default}\n"));
    out.push_str("*ColorModel Monochrome: \"\"\n");
    if caps.color {
        out.push_str("*ColorModel Color: \"\"\n");
    }
    out.push_str("*CloseUI: *ColorModel\n");
}

fn write_resolutions(out: &mut String, caps: &Capabilities) {
    if caps.resolutions.is_empty() {
        return;
    }
    let default = caps
        .default_resolution()
        .or_else(|| caps.min_resolution())
        .expect("resolutions is non-empty")
        .to_dpi_string();
    out.push_str("*OpenUI *Resolution: PickOne\n");
    out.push_str(&format!("*DefaultResolution: {default}\n"));
    for resolution in &caps.resolutions {
        out.push_str(&format!("*Resolution {}: \"\"\n", resolution.to_dpi_string()));
    }
    out.push_str("*CloseUI: *Resolution\n");
}

fn write_constraints(out: &mut String, constraints: &BTreeSet<Constraint>) {
    for constraint in constraints {
        let (Some(option1), Some(option2)) = (
            option_name(&constraint.keyword1),
            option_name(&constraint.keyword2),
        ) else {
            continue;
        };
        let choice1 = choice_token(&constraint.keyword1, &constraint.value1);
        let choice2 = choice_token(&constraint.keyword2, &constraint.value2);
        out.push_str(&format!(
            "*UIConstraints: \"*{option1} {choice1} *{option2} {choice2}\"\n"
        ));
        // The page-region alias mirrors every page-size constraint.
        if option1 == "PageSize" {
            out.push_str(&format!(
                "*UIConstraints: \"*PageRegion {choice1} *{option2} {choice2}\"\n"
            ));
        }
    }
}

/// The edits applied to a generated descriptor before installation.
#[derive(Debug, Default)]
pub struct DescriptorEdits {
    /// Insert the remote-queue directive.
    pub remote_queue: bool,
    /// Saved defaults to restore, keyed by capability keyword.
    pub option_defaults: BTreeMap<String, String>,
}

/// Applies the standard edits and returns the edited text together with the
/// descriptor's nickname.
pub fn edit_descriptor(descriptor: &str, edits: &DescriptorEdits) -> (String, Option<String>) {
    let mut lines: Vec<String> = Vec::new();
    let mut nickname = None;

    // Descriptor defaults that the saved options override.
    let mut default_overrides: BTreeMap<String, String> = BTreeMap::new();
    for (keyword, value) in &edits.option_defaults {
        if let Some(option) = option_name(keyword) {
            default_overrides.insert(option.to_string(), choice_token(keyword, value));
        }
    }

    for (i, line) in descriptor.lines().enumerate() {
        let mut line = line.to_string();

        if let Some(value) = line.strip_prefix("*NickName: ") {
            nickname = Some(value.trim().trim_matches('"').to_string());
        }

        if let Some(rest) = line.strip_prefix("*Default") {
            if let Some((option, _)) = rest.split_once(':') {
                if let Some(choice) = default_overrides.get(option) {
                    line = format!("*Default{option}: {choice}");
                }
            }
        }

        lines.push(line);

        // The redirection and remote-queue directives go right after the
        // header line.
        if i == 0 {
            lines.push(FILTER_REDIRECT_LINE.to_string());
            if edits.remote_queue {
                lines.push(REMOTE_QUEUE_LINE.to_string());
            }
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    (out, nickname)
}

/// Extracts the nickname from a descriptor without editing it.
pub fn descriptor_nickname(descriptor: &str) -> Option<String> {
    descriptor
        .lines()
        .find_map(|line| line.strip_prefix("*NickName: "))
        .map(|value| value.trim().trim_matches('"').to_string())
}
