//! Deterministic prompt rendering for the three topic agents.
//!
//! One renderer, parameterized by [`TopicTemplate`]. The output has a fixed
//! section order: purpose preamble, verbatim data block, forbidden
//! behaviours, tone rules, required headers. No timestamps, no randomness:
//! the same timeline always renders the same bytes.

use std::fmt::Write as _;

use super::topic::{Topic, TopicTemplate};
use crate::timeline::{LabEntry, Stage, Timeline};

const NO_LABS: &str = "No lab results listed";
const NO_MEDICATIONS: &str = "No medications listed";
const NO_FOLLOWUPS: &str = "No follow-up appointments listed";
const NO_PENDING: &str = "No pending results listed";

/// Human phrase for a kidney journey stage.
pub fn stage_phrase(stage: &Stage) -> &'static str {
    match stage {
        Stage::PostTransplant => "after a kidney transplant",
        Stage::AdvancedCkd => "with advanced chronic kidney disease",
        Stage::Dialysis => "while on dialysis",
        Stage::Other(_) => "during kidney care",
    }
}

/// System role instruction for a topic.
pub fn system_prompt(topic: Topic) -> &'static str {
    topic.template().system_instruction
}

/// One prompt line per lab result, verbatim.
///
/// Empty unit and reference range are left out rather than rendered as
/// blanks.
pub fn lab_line(entry: &LabEntry) -> String {
    let mut line = format!("- {}: {} = {}", entry.date, entry.lab_name, entry.value);
    if !entry.unit.trim().is_empty() {
        let _ = write!(line, " {}", entry.unit);
    }
    if !entry.reference_range.trim().is_empty() {
        let _ = write!(line, " (ref {})", entry.reference_range);
    }
    line
}

/// Render the user prompt for one topic.
pub fn render_prompt(topic: Topic, timeline: &Timeline) -> String {
    let template = topic.template();
    let mut out = String::new();

    // (a) Purpose
    let _ = writeln!(out, "{} {}.", template.purpose, stage_phrase(&timeline.stage));
    out.push_str(
        "Your role is to explain, not to diagnose, give medical advice, or predict outcomes.\n",
    );
    if topic == Topic::Medications {
        if let Some(reason) = &timeline.hospital_stay_reason {
            let _ = writeln!(out, "Recent hospital or clinic visit reason: {reason}");
        }
    }

    // (b) Data, verbatim
    out.push('\n');
    let _ = writeln!(out, "{}:", template.data_title);
    render_data_block(&mut out, topic, timeline);

    // (c) Forbidden behaviours, (d) tone
    out.push_str("\nRULES:\n");
    for rule in template.forbidden {
        let _ = writeln!(out, "- Do NOT {rule}");
    }
    out.push_str("\nTONE:\n");
    for rule in template.tone {
        let _ = writeln!(out, "- {rule}");
    }

    // (e) Required structure
    render_structure(&mut out, template);

    out.trim().to_string()
}

fn render_data_block(out: &mut String, topic: Topic, timeline: &Timeline) {
    match topic {
        Topic::Labs => {
            let lines: Vec<String> = timeline.valid_labs().map(lab_line).collect();
            push_bullets(out, &lines, NO_LABS);
        }
        Topic::Medications => {
            out.push_str("Previous medications:\n");
            push_bullets(out, &timeline.medications_before, NO_MEDICATIONS);
            out.push_str("Current medications:\n");
            push_bullets(out, &timeline.medications_after, NO_MEDICATIONS);
        }
        Topic::FollowUps => {
            out.push_str("Upcoming appointments and instructions:\n");
            push_bullets(out, &timeline.followups, NO_FOLLOWUPS);
            out.push_str("Pending results:\n");
            push_bullets(out, &timeline.pending_labs, NO_PENDING);
        }
    }
}

/// Bullet list, or a single placeholder bullet when empty.
fn push_bullets<S: AsRef<str>>(out: &mut String, items: &[S], placeholder: &str) {
    if items.is_empty() {
        let _ = writeln!(out, "- {placeholder}");
        return;
    }
    for item in items {
        let _ = writeln!(out, "- {}", item.as_ref());
    }
}

fn render_structure(out: &mut String, template: &TopicTemplate) {
    out.push_str(
        "\nSTRUCTURE RULES:\n\
         - Use the EXACT section headers below, in this order\n\
         - Do NOT add, remove, reorder, or rename sections\n\
         - Fill in ALL sections with patient-facing content\n\
         \nWrite ONLY the explanation using EXACTLY this structure:\n",
    );
    for header in template.required_headers {
        let _ = write!(out, "\n{header}\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transplant_timeline() -> Timeline {
        Timeline::new(Stage::PostTransplant).with_labs(vec![LabEntry::new(
            "2026-01-08",
            "Creatinine",
            "1.6",
            "mg/dL",
            "0.6–1.3",
        )])
    }

    // ── Stage phrasing ───────────────────────────────────

    #[test]
    fn stage_phrases() {
        assert_eq!(stage_phrase(&Stage::PostTransplant), "after a kidney transplant");
        assert_eq!(
            stage_phrase(&Stage::AdvancedCkd),
            "with advanced chronic kidney disease"
        );
        assert_eq!(stage_phrase(&Stage::Dialysis), "while on dialysis");
        assert_eq!(stage_phrase(&Stage::from("pre_dialysis")), "during kidney care");
    }

    // ── Lab rendering ────────────────────────────────────

    #[test]
    fn lab_prompt_contains_verbatim_line_and_stage() {
        let prompt = render_prompt(Topic::Labs, &transplant_timeline());
        assert!(prompt.contains("- 2026-01-08: Creatinine = 1.6 mg/dL (ref 0.6–1.3)\n"));
        assert!(prompt.contains("after a kidney transplant"));
    }

    #[test]
    fn lab_values_are_not_reformatted() {
        let timeline = Timeline::new(Stage::Dialysis).with_labs(vec![LabEntry::new(
            "8 Jan",
            "Potassium",
            "5.40",
            "mmol/L",
            "",
        )]);
        let prompt = render_prompt(Topic::Labs, &timeline);
        assert!(prompt.contains("- 8 Jan: Potassium = 5.40 mmol/L\n"));
    }

    #[test]
    fn lab_line_without_unit_or_range() {
        let line = lab_line(&LabEntry::new("2026-01-08", "eGFR", "48", "", ""));
        assert_eq!(line, "- 2026-01-08: eGFR = 48");
    }

    #[test]
    fn lab_order_is_preserved_and_invalid_rows_skipped() {
        let timeline = Timeline::new(Stage::Dialysis).with_labs(vec![
            LabEntry::new("2026-01-09", "B", "2", "", ""),
            LabEntry::default(),
            LabEntry::new("2026-01-08", "A", "1", "", ""),
        ]);
        let prompt = render_prompt(Topic::Labs, &timeline);
        let b = prompt.find("- 2026-01-09: B = 2").unwrap();
        let a = prompt.find("- 2026-01-08: A = 1").unwrap();
        assert!(b < a);
        assert!(!prompt.contains("- :"));
    }

    // ── Placeholders ─────────────────────────────────────

    #[test]
    fn empty_lists_render_placeholders() {
        let timeline = Timeline::new(Stage::AdvancedCkd);
        assert!(render_prompt(Topic::Labs, &timeline).contains("- No lab results listed"));

        let meds = render_prompt(Topic::Medications, &timeline);
        assert_eq!(meds.matches("- No medications listed").count(), 2);

        let follow = render_prompt(Topic::FollowUps, &timeline);
        assert!(follow.contains("- No follow-up appointments listed"));
        assert!(follow.contains("- No pending results listed"));
    }

    // ── Section order ────────────────────────────────────

    #[test]
    fn sections_appear_in_fixed_order() {
        let prompt = render_prompt(Topic::Labs, &transplant_timeline());
        let positions: Vec<usize> = [
            "You are explaining kidney lab trends",
            "LAB RESULTS",
            "RULES:",
            "TONE:",
            "STRUCTURE RULES:",
        ]
        .iter()
        .map(|needle| prompt.find(needle).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn required_headers_listed_in_order() {
        for topic in Topic::all() {
            let prompt = render_prompt(*topic, &transplant_timeline());
            let structure = &prompt[prompt.find("EXACTLY this structure").unwrap()..];
            let mut last = 0;
            for header in topic.required_headers() {
                let pos = structure.find(header).unwrap();
                assert!(pos >= last, "{topic}: {header} out of order");
                last = pos;
            }
            assert!(prompt.ends_with("🛟 Safety note"));
        }
    }

    #[test]
    fn preamble_forbids_diagnosis_and_advice() {
        for topic in Topic::all() {
            let prompt = render_prompt(*topic, &transplant_timeline());
            assert!(prompt.contains("not to diagnose, give medical advice, or predict outcomes"));
        }
    }

    // ── Topic-specific data ──────────────────────────────

    #[test]
    fn medication_prompt_lists_before_and_after() {
        let timeline = Timeline::new(Stage::PostTransplant)
            .with_hospital_stay_reason("dehydration")
            .with_medications(
                vec!["Tacrolimus 1mg".into(), "Prednisone 5mg".into()],
                vec!["Tacrolimus 2mg".into()],
            );
        let prompt = render_prompt(Topic::Medications, &timeline);
        assert!(prompt.contains(
            "Previous medications:\n- Tacrolimus 1mg\n- Prednisone 5mg\nCurrent medications:\n- Tacrolimus 2mg\n"
        ));
        assert!(prompt.contains("Recent hospital or clinic visit reason: dehydration"));
    }

    #[test]
    fn reason_only_in_medication_prompt() {
        let timeline = transplant_timeline().with_hospital_stay_reason("swelling");
        assert!(!render_prompt(Topic::Labs, &timeline).contains("swelling"));
    }

    #[test]
    fn followup_prompt_lists_both_blocks() {
        let timeline = Timeline::new(Stage::Dialysis).with_followups(
            vec!["Nephrology follow-up in 1 week".into()],
            vec!["Tacrolimus level".into()],
        );
        let prompt = render_prompt(Topic::FollowUps, &timeline);
        assert!(prompt.contains(
            "Upcoming appointments and instructions:\n- Nephrology follow-up in 1 week\nPending results:\n- Tacrolimus level\n"
        ));
    }

    // ── Determinism ──────────────────────────────────────

    #[test]
    fn rendering_is_deterministic() {
        let timeline = transplant_timeline()
            .with_medications(vec!["A".into()], vec!["B".into()])
            .with_followups(vec!["C".into()], vec![]);
        for topic in Topic::all() {
            assert_eq!(
                render_prompt(*topic, &timeline),
                render_prompt(*topic, &timeline.clone())
            );
        }
    }

    #[test]
    fn system_prompt_names_assistant() {
        assert!(system_prompt(Topic::Labs).starts_with("You are NephroBridge"));
    }
}
