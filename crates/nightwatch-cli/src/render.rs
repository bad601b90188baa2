//! Digest rendering: one HTML document for the morning email and a plain
//! text fallback. Pure transforms of the digest: no detector logic, no
//! system time, byte-identical output for the same digest.

use nightwatch_core::alert::{Alert, DetectorKind, RecordType, TrendDirection};
use nightwatch_core::digest::Digest;

const DANGER: &str = "#c62828";
const WARNING: &str = "#f9a825";
const GOOD: &str = "#2e7d32";
const MUTED: &str = "#6a737d";

pub fn render_html(digest: &Digest) -> String {
    let mut body = String::new();

    if digest.all_clear() {
        body.push_str(&format!(
            r#"<div style="text-align: center; padding: 48px 32px;">
<h2 style="color: {GOOD}; font-size: 24px; margin: 0 0 8px 0;">All clear</h2>
<p style="color: {MUTED}; font-size: 15px;">No anomalies detected across {} properties. Nightwatch is keeping watch.</p>
</div>
"#,
            digest.properties_analyzed
        ));
    } else {
        body.push_str(&format!(
            r#"<p style="font-size: 15px; line-height: 1.6;">Good morning. Nightwatch completed its overnight sweep of <strong>{} properties</strong>. Here is what needs attention:</p>
"#,
            digest.properties_analyzed
        ));
        body.push_str(&summary_cards(digest));
        body.push_str(&detector_section(
            digest,
            DetectorKind::Disaster,
            "Critical disasters (P0)",
            DANGER,
        ));
        body.push_str(&detector_section(
            digest,
            DetectorKind::Spam,
            "Probable spam traffic (P1)",
            WARNING,
        ));
        body.push_str(&record_section(digest));
        body.push_str(&trend_section(digest));
    }

    body.push_str(&patterns_section(digest));
    body.push_str(&issues_section(digest));

    if digest.suppressed_total > 0 {
        body.push_str(&format!(
            r#"<p style="color: {MUTED}; font-size: 12px;">{} lower-priority alerts were suppressed by per-property volume caps.</p>
"#,
            digest.suppressed_total
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Nightwatch daily digest — {date}</title>
</head>
<body style="margin: 0; padding: 0; font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background-color: #f5f5f5; color: #24292e;">
<table cellpadding="0" cellspacing="0" border="0" width="100%" style="background-color: #f5f5f5;">
<tr><td align="center" style="padding: 32px 16px;">
<table cellpadding="0" cellspacing="0" border="0" width="640" style="background-color: #ffffff; border-radius: 8px;">
<tr><td style="background-color: #1b2a41; padding: 32px; border-radius: 8px 8px 0 0;">
<h1 style="margin: 0; color: #ffffff; font-size: 26px; text-align: center;">Nightwatch</h1>
<p style="margin: 8px 0 0 0; color: rgba(255,255,255,0.85); font-size: 13px; text-align: center;">Daily portfolio digest — {date}</p>
</td></tr>
<tr><td style="padding: 32px;">
{body}</td></tr>
<tr><td style="padding: 24px; background: #f8f9fa; border-radius: 0 0 8px 8px;">
<p style="margin: 0; color: {MUTED}; font-size: 11px; text-align: center;">Generated {generated_at}</p>
</td></tr>
</table>
</td></tr>
</table>
</body>
</html>
"#,
        date = digest.reference_date,
        generated_at = digest.generated_at.format("%Y-%m-%d %H:%M UTC"),
    )
}

fn summary_cards(digest: &Digest) -> String {
    let card = |count: usize, label: &str, color: &str| {
        format!(
            r#"<td width="25%" align="center" style="padding: 16px; background: #f8f9fa; border-radius: 8px;">
<div style="color: {color}; font-size: 30px; font-weight: 700;">{count}</div>
<div style="color: {MUTED}; font-size: 11px; text-transform: uppercase;">{label}</div>
</td>
"#
        )
    };
    format!(
        "<table width=\"100%\" style=\"margin: 24px 0;\" cellpadding=\"0\" cellspacing=\"4\"><tr>\n{}{}{}{}</tr></table>\n",
        card(digest.counts.disaster, "Disasters (P0)", DANGER),
        card(digest.counts.spam, "Spam (P1)", WARNING),
        card(digest.counts.record, "Records", MUTED),
        card(digest.counts.trend, "Trends", MUTED),
    )
}

fn alert_card(alert: &Alert, accent: &str) -> String {
    let segment = if alert.dimension_value.is_empty() {
        alert.dimension.to_string()
    } else {
        format!("{} · {}", alert.dimension, escape(&alert.dimension_value))
    };
    format!(
        r#"<div style="border-left: 4px solid {accent}; background: #f8f9fa; border-radius: 0 8px 8px 0; padding: 14px 16px; margin-bottom: 10px;">
<div style="margin-bottom: 6px;"><strong>{property}</strong>
<span style="float: right; background: {accent}; color: #ffffff; padding: 2px 8px; border-radius: 4px; font-size: 11px; font-weight: 600;">{priority}</span></div>
<div style="font-size: 14px;">{message}</div>
<div style="color: {MUTED}; font-size: 12px; margin-top: 4px;">{segment} · {metric} · observed {observed} · baseline {baseline} · impact {impact}</div>
</div>
"#,
        property = escape(&alert.property_id),
        priority = alert.priority,
        message = escape(&alert.message),
        metric = alert.metric,
        observed = trim_float(alert.observed_value),
        baseline = trim_float(alert.baseline_value),
        impact = alert.business_impact,
    )
}

fn section(title: &str, color: &str, cards: String) -> String {
    if cards.is_empty() {
        return String::new();
    }
    format!(
        r#"<div style="margin-bottom: 24px;">
<h2 style="color: {color}; font-size: 18px; margin-bottom: 12px; padding-bottom: 8px; border-bottom: 2px solid #eeeeee;">{title}</h2>
{cards}</div>
"#
    )
}

fn detector_section(digest: &Digest, kind: DetectorKind, title: &str, color: &str) -> String {
    let cards: String = digest
        .alerts
        .iter()
        .filter(|a| a.detector == kind)
        .map(|a| alert_card(a, color))
        .collect();
    section(title, color, cards)
}

fn record_section(digest: &Digest) -> String {
    // Lows first (P1), then highs (P3); the ordered digest already
    // guarantees this within the filter.
    let cards: String = digest
        .alerts
        .iter()
        .filter(|a| a.detector == DetectorKind::Record)
        .map(|a| {
            let accent = match a.record_type() {
                Some(RecordType::Low) => DANGER,
                _ => GOOD,
            };
            alert_card(a, accent)
        })
        .collect();
    section("90-day records", MUTED, cards)
}

fn trend_section(digest: &Digest) -> String {
    let cards: String = digest
        .alerts
        .iter()
        .filter(|a| a.detector == DetectorKind::Trend)
        .map(|a| {
            let accent = match a.trend_direction() {
                Some(TrendDirection::Down) => WARNING,
                _ => GOOD,
            };
            alert_card(a, accent)
        })
        .collect();
    section("Trend shifts (30-day vs 180-day)", MUTED, cards)
}

fn patterns_section(digest: &Digest) -> String {
    let cards: String = digest
        .portfolio_patterns
        .iter()
        .map(|p| {
            format!(
                r#"<div style="border-left: 4px solid {WARNING}; background: #fffdf4; border-radius: 0 8px 8px 0; padding: 14px 16px; margin-bottom: 10px;">
<div style="font-size: 14px;"><strong>{affected} of {total} properties</strong> show the same {detector} anomaly on {metric} ({date}).</div>
<div style="color: {MUTED}; font-size: 12px; margin-top: 4px;">confidence: {confidence:?} · likely portfolio-wide, not client-specific</div>
</div>
"#,
                affected = p.affected_properties,
                total = p.total_properties,
                detector = p.detector,
                metric = p.metric,
                date = p.date,
                confidence = p.confidence,
            )
        })
        .collect();
    section("Portfolio-wide patterns", WARNING, cards)
}

fn issues_section(digest: &Digest) -> String {
    let rows: String = digest
        .issues
        .iter()
        .map(|issue| {
            let scope = match issue.detector {
                Some(kind) => format!("{} ({kind})", escape(&issue.property_id)),
                None => escape(&issue.property_id),
            };
            format!(
                "<li style=\"margin-bottom: 4px;\"><strong>{scope}</strong>: {reason:?} — {detail}</li>\n",
                reason = issue.reason,
                detail = escape(&issue.detail),
            )
        })
        .collect();
    if rows.is_empty() {
        return String::new();
    }
    section(
        "Issues",
        MUTED,
        format!("<ul style=\"font-size: 13px; color: {MUTED};\">\n{rows}</ul>\n"),
    )
}

pub fn render_text(digest: &Digest) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "NIGHTWATCH DAILY DIGEST — {}\n",
        digest.reference_date
    ));
    out.push_str(&format!(
        "Properties analyzed: {}\n",
        digest.properties_analyzed
    ));
    out.push_str(&format!(
        "Disasters: {} | Spam: {} | Records: {} | Trends: {}\n\n",
        digest.counts.disaster, digest.counts.spam, digest.counts.record, digest.counts.trend
    ));

    if digest.all_clear() {
        out.push_str("All clear: no anomalies detected.\n");
    } else {
        for alert in &digest.alerts {
            let segment = if alert.dimension_value.is_empty() {
                alert.dimension.to_string()
            } else {
                format!("{}/{}", alert.dimension, alert.dimension_value)
            };
            out.push_str(&format!(
                "[{}] {} {} {} — {} (impact {})\n",
                alert.priority,
                alert.property_id,
                segment,
                alert.metric,
                alert.message,
                alert.business_impact
            ));
        }
    }

    if !digest.portfolio_patterns.is_empty() {
        out.push('\n');
        out.push_str("Portfolio patterns:\n");
        for pattern in &digest.portfolio_patterns {
            out.push_str(&format!(
                "  {} of {} properties: {} anomaly on {} ({})\n",
                pattern.affected_properties,
                pattern.total_properties,
                pattern.detector,
                pattern.metric,
                pattern.date
            ));
        }
    }

    if !digest.all_clear_properties.is_empty() {
        out.push('\n');
        out.push_str(&format!(
            "All clear: {}\n",
            digest.all_clear_properties.join(", ")
        ));
    }

    if !digest.issues.is_empty() {
        out.push('\n');
        out.push_str("Issues:\n");
        for issue in &digest.issues {
            out.push_str(&format!(
                "  {}: {:?} — {}\n",
                issue.property_id, issue.reason, issue.detail
            ));
        }
    }

    if digest.suppressed_total > 0 {
        out.push_str(&format!(
            "\n{} lower-priority alerts suppressed by volume caps.\n",
            digest.suppressed_total
        ));
    }

    out
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn trim_float(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{NaiveDate, TimeZone, Utc};

    use nightwatch_core::alert::{
        AlertDetails, DetectionMethod, DisasterTrigger, Priority, Severity,
    };
    use nightwatch_core::dataset::{Dimension, Metric};
    use nightwatch_core::digest::consolidate;
    use nightwatch_core::registry::PropertyConfig;

    use super::*;

    fn property(id: &str) -> PropertyConfig {
        PropertyConfig {
            property_id: id.to_string(),
            dataset_id: format!("analytics_{id}"),
            client_name: format!("Client {id}"),
            domain: format!("{id}.example.com"),
            conversion_events: "purchase".to_string(),
            notes: None,
            is_configured: true,
            disabled_dimensions: vec![],
            min_sessions_override: None,
        }
    }

    fn disaster_alert(property_id: &str) -> Alert {
        Alert {
            detector: DetectorKind::Disaster,
            priority: Priority::P0,
            property_id: property_id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 11, 3).unwrap(),
            dimension: Dimension::Overall,
            dimension_value: String::new(),
            metric: Metric::Conversions,
            observed_value: 0.0,
            baseline_value: 4.0,
            delta: -1.0,
            severity: Severity::Critical,
            business_impact: 100,
            detection_methods: BTreeSet::from([DetectionMethod::Threshold]),
            message: "Conversion tracking failure: 0 conversions against a 4.0 conversion baseline"
                .to_string(),
            details: AlertDetails::Disaster {
                trigger: DisasterTrigger::TrackingFailure,
            },
            generated_at: Utc.with_ymd_and_hms(2025, 11, 6, 6, 0, 0).unwrap(),
        }
    }

    fn sample_digest() -> Digest {
        consolidate(
            Utc.with_ymd_and_hms(2025, 11, 6, 6, 0, 0).unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 6).unwrap(),
            &[property("prop_a"), property("prop_b")],
            vec![disaster_alert("prop_a")],
            vec![],
        )
    }

    #[test]
    fn html_contains_the_alert_and_the_all_clear_roll_up() {
        let digest = sample_digest();
        let html = render_html(&digest);
        assert!(html.contains("Nightwatch daily digest — 2025-11-06"));
        assert!(html.contains("Critical disasters (P0)"));
        assert!(html.contains("Conversion tracking failure"));
        assert!(html.contains("prop_a"));
    }

    #[test]
    fn all_clear_digest_renders_the_all_clear_block() {
        let digest = consolidate(
            Utc.with_ymd_and_hms(2025, 11, 6, 6, 0, 0).unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 6).unwrap(),
            &[property("prop_a")],
            vec![],
            vec![],
        );
        let html = render_html(&digest);
        assert!(html.contains("All clear"));
        assert!(!html.contains("needs attention"));

        let text = render_text(&digest);
        assert!(text.contains("All clear: no anomalies detected."));
    }

    #[test]
    fn rendering_is_deterministic() {
        let digest = sample_digest();
        assert_eq!(render_html(&digest), render_html(&digest));
        assert_eq!(render_text(&digest), render_text(&digest));
    }

    #[test]
    fn html_escapes_untrusted_dimension_values() {
        let mut alert = disaster_alert("prop_a");
        alert.dimension = Dimension::LandingPage;
        alert.dimension_value = "/search?q=<script>".to_string();
        let digest = consolidate(
            Utc.with_ymd_and_hms(2025, 11, 6, 6, 0, 0).unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 6).unwrap(),
            &[property("prop_a")],
            vec![alert],
            vec![],
        );
        let html = render_html(&digest);
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn text_lists_alerts_in_digest_order() {
        let mut spam = disaster_alert("prop_b");
        spam.detector = DetectorKind::Spam;
        spam.priority = Priority::P1;
        spam.business_impact = 80;
        spam.details = AlertDetails::Spam {
            z_score: 8.0,
            bounce_rate: 0.9,
            avg_session_duration: 4.0,
        };
        let digest = consolidate(
            Utc.with_ymd_and_hms(2025, 11, 6, 6, 0, 0).unwrap(),
            NaiveDate::from_ymd_opt(2025, 11, 6).unwrap(),
            &[property("prop_a"), property("prop_b")],
            vec![spam, disaster_alert("prop_a")],
            vec![],
        );
        let text = render_text(&digest);
        let p0 = text.find("[P0]").expect("P0 line");
        let p1 = text.find("[P1]").expect("P1 line");
        assert!(p0 < p1);
    }
}
