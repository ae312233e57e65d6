//! Human-readable rendering of daemon replies.

use rollcall_core::{Identity, RecognitionLogRecord, RecognitionReport};
use rollcall_extract::FaceMark;

pub fn recognition_lines(report: &RecognitionReport) -> Vec<String> {
    if report.results.is_empty() {
        return vec![format!("{}: no faces detected", report.source_image)];
    }
    let mut lines = vec![format!(
        "{}: {} face(s), {} recognised",
        report.source_image,
        report.results.len(),
        report.matched_count()
    )];
    for (i, r) in report.results.iter().enumerate() {
        let position = r
            .verdict
            .bounding_box
            .map(|b| format!(" at [{}, {}, {}, {}]", b.top, b.right, b.bottom, b.left))
            .unwrap_or_default();
        let who = match (&r.identity, r.verdict.matched) {
            (Some(identity), true) => format!(
                "{} (id {}, confidence {:.2})",
                identity.name, identity.id, r.verdict.confidence
            ),
            _ => "unknown".to_string(),
        };
        lines.push(format!("  face {}{position}: {who}", i + 1));
    }
    for warning in &report.audit_warnings {
        lines.push(format!("  warning: attempt not logged: {warning}"));
    }
    lines
}

pub fn face_marks(report: &RecognitionReport) -> Vec<FaceMark> {
    report
        .results
        .iter()
        .filter_map(|r| {
            r.verdict.bounding_box.map(|bounding_box| FaceMark {
                bounding_box,
                matched: r.verdict.matched,
            })
        })
        .collect()
}

pub fn identity_lines(identities: &[Identity]) -> Vec<String> {
    if identities.is_empty() {
        return vec!["No identities enrolled".to_string()];
    }
    let mut lines = vec![format!(
        "{:>5}  {:<24} {:>4}  {:<8} {:<16} {}",
        "ID", "NAME", "AGE", "GENDER", "PHONE", "EMAIL"
    )];
    for p in identities {
        lines.push(format!(
            "{:>5}  {:<24} {:>4}  {:<8} {:<16} {}",
            p.id,
            p.name,
            p.age.map(|a| a.to_string()).unwrap_or_else(|| "-".into()),
            p.gender.as_deref().unwrap_or("-"),
            p.phone.as_deref().unwrap_or("-"),
            p.email.as_deref().unwrap_or("-"),
        ));
    }
    lines
}

pub fn log_lines(logs: &[RecognitionLogRecord]) -> Vec<String> {
    if logs.is_empty() {
        return vec!["No recognition attempts logged".to_string()];
    }
    logs.iter()
        .map(|log| {
            let who = match (&log.name, log.entry.identity_id) {
                (Some(name), Some(id)) => format!("{name} (id {id})"),
                (None, Some(id)) => format!("id {id}"),
                _ => "unknown".to_string(),
            };
            format!(
                "{}  {:<28} {:.2}  {}",
                log.entry.recognized_at.format("%Y-%m-%d %H:%M:%S"),
                who,
                log.entry.confidence,
                log.entry.source_image
            )
        })
        .collect()
}
