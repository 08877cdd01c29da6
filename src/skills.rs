//! Skill loading and slash-command routing.
//!
//! Skills are purely instructional: a `SKILL.md` with front-matter metadata.
//! The router only rewrites matching `/command` input into a directive
//! naming the skill; the model loads the skill file itself via its read
//! tool.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const MAX_COMMAND_LEN: usize = 32;

/// A loaded skill.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    /// Sanitized slash-command alias, unique within the set.
    pub command: String,
    pub file_path: PathBuf,
    pub user_invocable: bool,
    pub disable_model_invocation: bool,
}

/// Ordered skill collection with command aliases.
#[derive(Debug, Clone, Default)]
pub struct SkillSet {
    skills: Vec<Skill>,
}

impl SkillSet {
    pub fn skills(&self) -> &[Skill] {
        &self.skills
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Strict lookup by command alias.
    pub fn find_command(&self, command: &str) -> Option<&Skill> {
        self.skills
            .iter()
            .find(|s| s.user_invocable && s.command == command)
    }

    /// Fuzzy lookup: exact match on command alias, skill name, or the
    /// sanitized variant of the skill name.
    pub fn find_fuzzy(&self, name: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| {
            s.user_invocable
                && (s.command == name
                    || s.name == name
                    || sanitize_command_name(&s.name) == name)
        })
    }

    /// The `<available_skills>` XML block for the system prompt. Skills with
    /// model invocation disabled are omitted.
    pub fn prompt_block(&self) -> String {
        let visible: Vec<&Skill> = self
            .skills
            .iter()
            .filter(|s| !s.disable_model_invocation)
            .collect();
        if visible.is_empty() {
            return String::new();
        }

        let mut lines = vec![
            "The following skills provide specialized instructions for specific tasks."
                .to_string(),
            "Use the read tool to load a skill's file when the task matches its description."
                .to_string(),
            String::new(),
            "<available_skills>".to_string(),
        ];
        for skill in visible {
            lines.push("  <skill>".to_string());
            lines.push(format!("    <name>{}</name>", escape_xml(&skill.name)));
            lines.push(format!(
                "    <description>{}</description>",
                escape_xml(&skill.description)
            ));
            lines.push(format!(
                "    <location>{}</location>",
                escape_xml(&skill.file_path.display().to_string())
            ));
            lines.push("  </skill>".to_string());
        }
        lines.push("</available_skills>".to_string());
        lines.join("\n")
    }
}

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ============================================================================
// Loading
// ============================================================================

/// Load skills from directories in precedence order (e.g. global, managed,
/// workspace). On a name collision the later directory wins. Missing
/// directories are silently skipped.
pub fn load_skills(dirs: &[PathBuf]) -> SkillSet {
    let mut by_name: HashMap<String, Skill> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for dir in dirs {
        for skill in skills_in_dir(dir) {
            if by_name.insert(skill.name.clone(), skill.clone()).is_none() {
                order.push(skill.name);
            } else {
                tracing::debug!(skill = %skill.name, dir = %dir.display(), "skill overridden");
            }
        }
    }

    let mut skills: Vec<Skill> = order
        .into_iter()
        .filter_map(|name| by_name.remove(&name))
        .collect();
    assign_commands(&mut skills);
    SkillSet { skills }
}

fn skills_in_dir(dir: &Path) -> Vec<Skill> {
    let mut skills = Vec::new();
    let Ok(entries) = fs::read_dir(dir) else {
        tracing::debug!(dir = %dir.display(), "skill directory missing, ignored");
        return skills;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let manifest = path.join("SKILL.md");
        if !manifest.is_file() {
            continue;
        }
        match load_skill_file(&manifest) {
            Some(skill) => skills.push(skill),
            None => {
                tracing::warn!(path = %manifest.display(), "skill skipped: missing description");
            }
        }
    }

    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

fn load_skill_file(path: &Path) -> Option<Skill> {
    let raw = fs::read_to_string(path).ok()?;
    let frontmatter = parse_frontmatter(&raw);

    let description = frontmatter.get("description").cloned()?;
    if description.trim().is_empty() {
        return None;
    }

    let parent = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|s| s.to_str())
        .unwrap_or("skill")
        .to_string();
    let name = frontmatter
        .get("name")
        .filter(|n| !n.trim().is_empty())
        .cloned()
        .unwrap_or(parent);

    Some(Skill {
        name,
        description,
        command: String::new(), // assigned after dedup
        file_path: path.to_path_buf(),
        user_invocable: frontmatter
            .get("user-invocable")
            .map_or(true, |v| !v.eq_ignore_ascii_case("false")),
        disable_model_invocation: frontmatter
            .get("disable-model-invocation")
            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
    })
}

/// Parse the YAML-ish `key: value` front-matter between leading `---` lines.
fn parse_frontmatter(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut lines = raw.lines();
    if lines.next().map(str::trim) != Some("---") {
        return out;
    }
    for line in lines {
        let trimmed = line.trim();
        if trimmed == "---" {
            break;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            out.insert(
                key.trim().to_string(),
                value.trim().trim_matches(['"', '\'']).to_string(),
            );
        }
    }
    out
}

// ============================================================================
// Command names
// ============================================================================

/// Produce a slash-command alias: lowercase, non-alphanumerics collapsed to
/// single underscores, trimmed, capped at 32 chars, `skill` as fallback.
pub fn sanitize_command_name(name: &str) -> String {
    let mut out = String::new();
    let mut last_was_underscore = false;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_underscore = false;
        } else if !last_was_underscore && !out.is_empty() {
            out.push('_');
            last_was_underscore = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let mut command: String = trimmed.chars().take(MAX_COMMAND_LEN).collect();
    let command_trimmed = command.trim_matches('_').to_string();
    command = command_trimmed;
    if command.is_empty() {
        command = "skill".to_string();
    }
    command
}

fn assign_commands(skills: &mut [Skill]) {
    let mut used: HashMap<String, usize> = HashMap::new();
    for skill in skills {
        let base = sanitize_command_name(&skill.name);
        let count = used.entry(base.clone()).or_insert(0);
        *count += 1;
        skill.command = if *count == 1 {
            base
        } else {
            format!("{base}_{count}")
        };
    }
}

// ============================================================================
// Routing
// ============================================================================

/// A matched slash command, with the rewritten user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillInvocation {
    pub skill_name: String,
    pub rewritten: String,
}

/// Rewrite `/name args` (strict) or `/skill name args` (fuzzy) input into a
/// skill directive. Non-command input and unknown names pass through as
/// `None`.
pub fn route_input(input: &str, skills: &SkillSet) -> Option<SkillInvocation> {
    let rest = input.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    if head.is_empty() {
        return None;
    }

    let (skill, args) = if head == "skill" {
        let (name, args) = match args.split_once(char::is_whitespace) {
            Some((name, tail)) => (name, tail.trim()),
            None => (args, ""),
        };
        (skills.find_fuzzy(name)?, args)
    } else {
        (skills.find_command(head)?, args)
    };

    Some(SkillInvocation {
        skill_name: skill.name.clone(),
        rewritten: format!(
            "Use the \"{}\" skill for this request.\n\nUser input:\n{args}",
            skill.name
        ),
    })
}
