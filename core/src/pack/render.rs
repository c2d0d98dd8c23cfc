//! Pack renderers: XML (the canonical form), JSON (mirroring the XML
//! structure), and Markdown. Element order is stable and documented:
//! project-state, decisions, constraints, active-tasks, plans,
//! recent-context, instructions.

use serde_json::json;

use super::PackDocument;
use super::budget::Section;

pub(crate) const INSTRUCTIONS_TEXT: &str =
    "Paste this into a fresh agent session to restore project context.";

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

pub(crate) fn render_xml(doc: &PackDocument) -> String {
    let mut out = String::new();
    out.push_str("<context-pack version=\"1.0\"");
    out.push_str(&format!(
        " generated-at=\"{}\" mode=\"{}\">\n",
        escape_xml(&doc.generated_at),
        doc.mode
    ));

    out.push_str("  <project-state");
    out.push_str(&format!(" sessions=\"{}\">\n", doc.session_count));
    out.push_str(&format!("    {}\n", escape_xml(&doc.summary)));
    out.push_str("  </project-state>\n");

    for section in &doc.sections {
        render_xml_section(&mut out, section);
    }

    out.push_str(&format!(
        "  <instructions>{}</instructions>\n",
        escape_xml(&doc.instructions)
    ));
    out.push_str("</context-pack>\n");
    out
}

fn render_xml_section(out: &mut String, section: &Section) {
    out.push_str(&format!(
        "  <{} count=\"{}\">\n",
        section.name,
        section.items.len()
    ));
    for item in &section.items {
        out.push_str(&format!(
            "    <item id=\"{}\" source-type=\"{}\" session=\"{}\"",
            escape_xml(&item.id),
            escape_xml(&item.source_type),
            escape_xml(&item.session),
        ));
        if let Some(label) = &item.label {
            out.push_str(&format!(" label=\"{}\"", escape_xml(label)));
        }
        out.push('>');
        out.push_str(&escape_xml(&item.body));
        out.push_str("</item>\n");
    }
    out.push_str(&format!("  </{}>\n", section.name));
}

pub(crate) fn render_json(doc: &PackDocument) -> String {
    let mut root = json!({
        "version": "1.0",
        "generated_at": doc.generated_at,
        "mode": doc.mode.to_string(),
        "project_state": {
            "sessions": doc.session_count,
            "summary": doc.summary,
        },
        "instructions": doc.instructions,
    });

    for section in &doc.sections {
        let items: Vec<serde_json::Value> = section
            .items
            .iter()
            .map(|item| {
                let mut value = json!({
                    "id": item.id,
                    "source_type": item.source_type,
                    "session": item.session,
                    "text": item.body,
                });
                if let Some(label) = &item.label {
                    value["label"] = json!(label);
                }
                value
            })
            .collect();
        root[section.name.replace('-', "_")] = json!({
            "count": section.items.len(),
            "items": items,
        });
    }

    serde_json::to_string_pretty(&root).unwrap_or_default()
}

pub(crate) fn render_markdown(doc: &PackDocument) -> String {
    let mut lines: Vec<String> = Vec::new();
    lines.push("# Context Pack".to_string());
    lines.push(String::new());
    lines.push(format!(
        "**Generated**: {} · **Mode**: {} · **Sessions**: {}",
        doc.generated_at, doc.mode, doc.session_count
    ));
    lines.push(String::new());

    lines.push("## Project State".to_string());
    lines.push(String::new());
    lines.push(doc.summary.clone());
    lines.push(String::new());

    for section in &doc.sections {
        lines.push(format!("## {} ({})", title_case(section.name), section.items.len()));
        lines.push(String::new());
        for item in &section.items {
            let label = item
                .label
                .as_ref()
                .map(|l| format!(" [{l}]"))
                .unwrap_or_default();
            lines.push(format!(
                "- **{}**{label} _({} · {})_",
                item.id, item.source_type, item.session
            ));
            for body_line in item.body.lines() {
                lines.push(format!("  > {body_line}"));
            }
        }
        lines.push(String::new());
    }

    lines.push("---".to_string());
    lines.push(format!("*{}*", doc.instructions));
    lines.push(String::new());
    lines.join("\n")
}

fn title_case(name: &str) -> String {
    name.split('-')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::PackMode;
    use crate::pack::budget::SectionItem;
    use pretty_assertions::assert_eq;

    fn doc() -> PackDocument {
        PackDocument {
            generated_at: "2025-01-01T00:00:00Z".to_string(),
            mode: PackMode::Build,
            session_count: 2,
            summary: "Summary with <angle> & ampersand.".to_string(),
            sections: vec![Section {
                name: "decisions",
                items: vec![SectionItem {
                    id: "D1".to_string(),
                    source_type: "session".to_string(),
                    session: "state".to_string(),
                    body: "Use JSONL logs".to_string(),
                    label: None,
                }],
            }],
            instructions: INSTRUCTIONS_TEXT.to_string(),
        }
    }

    #[test]
    fn xml_has_stable_element_order_and_escaping() {
        let xml = render_xml(&doc());
        assert!(xml.starts_with("<context-pack version=\"1.0\""));
        assert!(xml.contains("&lt;angle&gt; &amp; ampersand"));
        let state_pos = xml.find("<project-state").expect("project-state");
        let decisions_pos = xml.find("<decisions").expect("decisions");
        let instructions_pos = xml.find("<instructions>").expect("instructions");
        assert!(state_pos < decisions_pos);
        assert!(decisions_pos < instructions_pos);
        assert!(xml.contains("<decisions count=\"1\">"));
        assert!(xml.contains("id=\"D1\""));
        assert!(xml.contains("source-type=\"session\""));
    }

    #[test]
    fn json_mirrors_the_xml_sections() {
        let raw = render_json(&doc());
        let value: serde_json::Value = serde_json::from_str(&raw).expect("parse json");
        assert_eq!(value["version"], "1.0");
        assert_eq!(value["decisions"]["count"], 1);
        assert_eq!(value["decisions"]["items"][0]["id"], "D1");
        assert_eq!(value["project_state"]["sessions"], 2);
    }

    #[test]
    fn markdown_uses_headings() {
        let md = render_markdown(&doc());
        assert!(md.contains("# Context Pack"));
        assert!(md.contains("## Project State"));
        assert!(md.contains("## Decisions (1)"));
        assert!(md.contains("- **D1**"));
    }
}
