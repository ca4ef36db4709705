//! Minimal git-config-syntax reader/writer used for the sub-repository
//! registry file. Parses into sections and key/value entries, and serialises
//! back preserving unknown sections and unrecognised lines verbatim.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    pub subsection: Option<String>,
    header_raw: String,
    lines: Vec<Line>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry { key: String, value: String, raw: String },
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    preamble: Vec<String>,
    sections: Vec<Section>,
}

fn render_header(name: &str, subsection: Option<&str>) -> String {
    match subsection {
        Some(sub) => format!("[{} \"{}\"]", name, sub.replace('\\', "\\\\").replace('"', "\\\"")),
        None => format!("[{name}]"),
    }
}

fn parse_header(line: &str) -> Option<(String, Option<String>)> {
    let inner = line.trim().strip_prefix('[')?.strip_suffix(']')?;
    match inner.find(' ') {
        None => Some((inner.trim().to_ascii_lowercase(), None)),
        Some(split) => {
            let name = inner[..split].trim().to_ascii_lowercase();
            let rest = inner[split..].trim();
            let quoted = rest.strip_prefix('"')?.strip_suffix('"')?;
            let mut sub = String::new();
            let mut chars = quoted.chars();
            while let Some(ch) = chars.next() {
                if ch == '\\' {
                    match chars.next() {
                        Some(escaped) => sub.push(escaped),
                        None => return None,
                    }
                } else {
                    sub.push(ch);
                }
            }
            Some((name, Some(sub)))
        }
    }
}

fn parse_entry(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
        return None;
    }
    let eq = trimmed.find('=')?;
    let key = trimmed[..eq].trim().to_ascii_lowercase();
    let mut value = trimmed[eq + 1..].trim().to_string();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        value = value[1..value.len() - 1].to_string();
    }
    if key.is_empty() { None } else { Some((key, value)) }
}

impl Section {
    fn new(name: &str, subsection: Option<&str>) -> Self {
        Section {
            name: name.to_ascii_lowercase(),
            subsection: subsection.map(str::to_string),
            header_raw: render_header(name, subsection),
            lines: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if *k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let lowered = key.to_ascii_lowercase();
        let raw = format!("\t{lowered} = {value}");
        for line in &mut self.lines {
            if let Line::Entry { key: k, value: v, raw: r } = line
                && *k == lowered
            {
                *v = value.to_string();
                *r = raw;
                return;
            }
        }
        self.lines.push(Line::Entry {
            key: lowered,
            value: value.to_string(),
            raw,
        });
    }
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<ConfigFile> {
        let mut file = ConfigFile::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with('[') {
                let (name, subsection) = parse_header(line).ok_or_else(|| {
                    Error::internal(format!("malformed config section header: {line}"))
                })?;
                file.sections.push(Section {
                    name,
                    subsection,
                    header_raw: line.to_string(),
                    lines: Vec::new(),
                });
                continue;
            }
            let target = match file.sections.last_mut() {
                Some(section) => &mut section.lines,
                None => {
                    file.preamble.push(line.to_string());
                    continue;
                }
            };
            match parse_entry(line) {
                Some((key, value)) => target.push(Line::Entry {
                    key,
                    value,
                    raw: line.to_string(),
                }),
                None => target.push(Line::Other(line.to_string())),
            }
        }
        Ok(file)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn section(&self, name: &str, subsection: Option<&str>) -> Option<&Section> {
        let name = name.to_ascii_lowercase();
        self.sections
            .iter()
            .find(|s| s.name == name && s.subsection.as_deref() == subsection)
    }

    pub fn section_mut(&mut self, name: &str, subsection: Option<&str>) -> &mut Section {
        let lowered = name.to_ascii_lowercase();
        let position = self
            .sections
            .iter()
            .position(|s| s.name == lowered && s.subsection.as_deref() == subsection);
        match position {
            Some(idx) => &mut self.sections[idx],
            None => {
                self.sections.push(Section::new(name, subsection));
                self.sections.last_mut().expect("section just pushed")
            }
        }
    }

    /// Drop a section entirely. Unknown sections are untouched.
    pub fn remove_section(&mut self, name: &str, subsection: Option<&str>) -> bool {
        let lowered = name.to_ascii_lowercase();
        let before = self.sections.len();
        self.sections
            .retain(|s| !(s.name == lowered && s.subsection.as_deref() == subsection));
        before != self.sections.len()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.preamble {
            out.push_str(line);
            out.push('\n');
        }
        for section in &self.sections {
            out.push_str(&section.header_raw);
            out.push('\n');
            for line in &section.lines {
                match line {
                    Line::Entry { raw, .. } | Line::Other(raw) => {
                        out.push_str(raw);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }
}
