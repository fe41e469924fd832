//! Parser for the line-oriented table-definition language.
//!
//! ```text
//! # optional table comment
//! subject_id : int32           # subject identifier
//! ---
//! -> [nullable] Session
//! weight=null : float64        # weight in grams
//! index (weight)
//! unique index (subject_id, weight)
//! ```
//!
//! Parsing is pure: foreign key references are kept as names and resolved
//! later against a declaration context, and SQL generation happens in the
//! dialect layer. The ALTER diff over rendered column definitions also lives
//! here because it is backend-independent.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::types::{classify_type, DeclaredType};

/// SQL literals allowed unquoted as default values.
const CONSTANT_LITERALS: [&str; 2] = ["CURRENT_TIMESTAMP", "NULL"];

/// One parsed attribute line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAttribute {
    pub name: String,
    /// The raw declared type string, e.g. `"int32"` or `"<blob@cold>"`.
    pub type_spec: String,
    pub declared_type: DeclaredType,
    /// Default literal as written (without quotes), `None` if absent.
    pub default: Option<String>,
    /// `true` when the default is `null` (nullable attribute).
    pub nullable: bool,
    pub comment: String,
    pub in_key: bool,
}

impl ParsedAttribute {
    /// The rename source when the comment carries the `{old_name}` sentinel
    /// used by ALTER to recognize renames.
    pub fn renamed_from(&self) -> Option<&str> {
        static RENAME: LazyLock<Regex> =
            LazyLock::new(|| Regex::new(r"^\{\s*(?P<name>\w+)\s*\}").expect("rename sentinel"));
        RENAME
            .captures(&self.comment)
            .map(|c| c.name("name").expect("name group").as_str())
    }
}

/// Options on a foreign key line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyOption {
    Nullable,
    Unique,
}

/// One parsed foreign key line, reference unresolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedForeignKey {
    pub options: Vec<ForeignKeyOption>,
    /// The referenced name, resolved later against a declaration context.
    pub reference: String,
    pub in_key: bool,
}

/// One parsed index line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIndex {
    pub unique: bool,
    pub attributes: Vec<String>,
}

/// A definition item in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionItem {
    Attribute(ParsedAttribute),
    ForeignKey(ParsedForeignKey),
    Index(ParsedIndex),
}

/// The parsed form of a complete table definition.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedDefinition {
    pub comment: String,
    pub items: Vec<DefinitionItem>,
}

impl ParsedDefinition {
    /// Attribute items in order.
    pub fn attributes(&self) -> impl Iterator<Item = &ParsedAttribute> {
        self.items.iter().filter_map(|item| match item {
            DefinitionItem::Attribute(a) => Some(a),
            _ => None,
        })
    }

    /// Foreign key items in order.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &ParsedForeignKey> {
        self.items.iter().filter_map(|item| match item {
            DefinitionItem::ForeignKey(fk) => Some(fk),
            _ => None,
        })
    }

    /// Index items in order.
    pub fn indexes(&self) -> impl Iterator<Item = &ParsedIndex> {
        self.items.iter().filter_map(|item| match item {
            DefinitionItem::Index(ix) => Some(ix),
            _ => None,
        })
    }

    /// Whether any item declares into the primary key.
    pub fn has_primary_items(&self) -> bool {
        self.items.iter().any(|item| match item {
            DefinitionItem::Attribute(a) => a.in_key,
            DefinitionItem::ForeignKey(fk) => fk.in_key,
            DefinitionItem::Index(_) => false,
        })
    }
}

static ATTRIBUTE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("attribute name pattern"));

static INDEX_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<unique>unique\s+)?index\s*\(\s*(?P<args>.*)\)\s*$").expect("index pattern")
});

static FK_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^->\s*(\[\s*(?P<options>[a-zA-Z ,]*)\])?\s*(?P<ref>\S.*)$").expect("fk pattern")
});

/// Parses a complete definition string.
pub fn parse_definition(definition: &str) -> Result<ParsedDefinition> {
    let mut lines: Vec<&str> = definition.trim().lines().map(str::trim).collect();
    let mut parsed = ParsedDefinition::default();

    // optional leading table comment
    if lines.first().is_some_and(|l| l.starts_with('#')) {
        let first = lines.remove(0);
        parsed.comment = first[1..].trim().to_string();
        if parsed.comment.starts_with(':') {
            return Err(Error::declaration(
                "table comment must not start with a colon \":\"".to_string(),
            ));
        }
    }

    let mut in_key = true;
    for line in lines {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("---") || line.starts_with("___") {
            in_key = false;
            continue;
        }
        if is_foreign_key(line) {
            parsed.items.push(DefinitionItem::ForeignKey(parse_foreign_key(line, in_key)?));
        } else if let Some(caps) = INDEX_LINE.captures(line) {
            let attributes: Vec<String> = caps["args"]
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            if attributes.is_empty() {
                return Err(Error::declaration(format!("syntax error in index line \"{line}\"")));
            }
            parsed.items.push(DefinitionItem::Index(ParsedIndex {
                unique: caps.name("unique").is_some(),
                attributes,
            }));
        } else {
            parsed
                .items
                .push(DefinitionItem::Attribute(parse_attribute(line, in_key)?));
        }
    }
    Ok(parsed)
}

/// Whether a line is a foreign key reference: `->` appears before any quote
/// or comment character.
fn is_foreign_key(line: &str) -> bool {
    match line.find("->") {
        Some(pos) => !line[..pos].contains(['"', '\'', '#']),
        None => false,
    }
}

fn parse_foreign_key(line: &str, in_key: bool) -> Result<ParsedForeignKey> {
    let caps = FK_LINE
        .captures(line)
        .ok_or_else(|| Error::declaration(format!("parsing error in line \"{line}\"")))?;
    let mut options = Vec::new();
    if let Some(opts) = caps.name("options") {
        for opt in opts.as_str().split(',') {
            let opt = opt.trim();
            if opt.is_empty() {
                continue;
            }
            match opt.to_ascii_uppercase().as_str() {
                "NULLABLE" => options.push(ForeignKeyOption::Nullable),
                "UNIQUE" => options.push(ForeignKeyOption::Unique),
                other => {
                    return Err(Error::declaration(format!(
                        "invalid foreign key option \"{other}\""
                    )));
                }
            }
        }
    }
    if in_key && options.contains(&ForeignKeyOption::Nullable) {
        return Err(Error::declaration(format!(
            "primary dependencies cannot be nullable in line \"{line}\""
        )));
    }
    Ok(ParsedForeignKey {
        options,
        reference: caps["ref"].trim().to_string(),
        in_key,
    })
}

/// Parses one attribute line: `name[=default] : type [# comment]`.
fn parse_attribute(line: &str, in_key: bool) -> Result<ParsedAttribute> {
    let syntax_error = || Error::declaration(format!("declaration syntax error in line \"{line}\""));

    let colon = find_outside_quotes(line, ':').ok_or_else(syntax_error)?;
    let (head, rest) = (line[..colon].trim(), &line[colon + 1..]);

    let (name, default) = match find_outside_quotes(head, '=') {
        Some(eq) => (head[..eq].trim(), Some(head[eq + 1..].trim())),
        None => (head, None),
    };
    if !ATTRIBUTE_NAME.is_match(name) {
        return Err(Error::declaration(format!(
            "invalid attribute name `{name}` in line \"{line}\""
        )));
    }

    let (type_spec, comment) = match find_outside_quotes(rest, '#') {
        Some(hash) => (rest[..hash].trim(), rest[hash + 1..].trim()),
        None => (rest.trim(), ""),
    };
    if type_spec.is_empty() {
        return Err(syntax_error());
    }
    if comment.starts_with(':') {
        return Err(Error::declaration(format!(
            "an attribute comment must not start with a colon in comment \"{comment}\""
        )));
    }

    let nullable = default.is_some_and(|d| d.eq_ignore_ascii_case("null"));
    if nullable && in_key {
        return Err(Error::declaration(format!(
            "primary key attributes cannot be nullable in line \"{line}\""
        )));
    }

    let declared_type = classify_type(type_spec)?;
    if let DeclaredType::Native(native) = &declared_type {
        tracing::warn!(
            "native type '{native}' used in attribute '{name}'; \
             consider a core type for better portability"
        );
    }

    // strip quotes from string defaults; constants stay as written
    let default = default.map(|d| {
        let d = d.trim();
        d.strip_prefix('"')
            .and_then(|d| d.strip_suffix('"'))
            .or_else(|| d.strip_prefix('\'').and_then(|d| d.strip_suffix('\'')))
            .unwrap_or(d)
            .to_string()
    });

    Ok(ParsedAttribute {
        name: name.to_string(),
        type_spec: type_spec.to_string(),
        declared_type,
        default,
        nullable,
        comment: comment.to_string(),
        in_key,
    })
}

/// Finds the first `needle` outside single/double quotes and angle brackets.
fn find_outside_quotes(s: &str, needle: char) -> Option<usize> {
    let mut in_single = false;
    let mut in_double = false;
    let mut in_angle = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '<' if !in_single && !in_double => in_angle += 1,
            '>' if !in_single && !in_double && in_angle > 0 => in_angle -= 1,
            c if c == needle && !in_single && !in_double && in_angle == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// Whether a default literal may appear unquoted in DDL.
pub fn is_constant_literal(default: &str) -> bool {
    let head = default.split('(').next().unwrap_or(default).trim();
    CONSTANT_LITERALS.iter().any(|lit| head.eq_ignore_ascii_case(lit))
}

// ---------------------------------------------------------------------------
// ALTER diff
// ---------------------------------------------------------------------------

/// One rendered column handed to the ALTER diff: the name, the full
/// backend-specific definition SQL, and the rename source if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedColumn {
    pub name: String,
    pub definition: String,
    pub renamed_from: Option<String>,
}

/// An ALTER operation produced by [`diff_columns`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterOp {
    Add { definition: String, after: Option<String> },
    Modify { definition: String, after: Option<String> },
    Change { old_name: String, definition: String, after: Option<String> },
    Drop { name: String },
}

/// Diffs two rendered column lists into ALTER operations. Only secondary
/// attributes may change; the caller verifies the primary key, foreign keys,
/// and indexes are identical before invoking this.
pub fn diff_columns(
    new: &[RenderedColumn],
    old: &[RenderedColumn],
    primary_key: &[String],
) -> Result<Vec<AlterOp>> {
    // validate rename sources: used once, and existing in the old definition
    let old_names: Vec<&str> = old.iter().map(|c| c.name.as_str()).collect();
    let mut renamed: Vec<&str> = Vec::new();
    for col in new {
        if let Some(src) = col.renamed_from.as_deref() {
            if renamed.contains(&src) {
                return Err(Error::declaration(format!(
                    "alter attempted to rename attribute {{{src}}} twice"
                )));
            }
            if !old_names.contains(&src) {
                return Err(Error::declaration(format!(
                    "attribute {src} does not exist in the original definition"
                )));
            }
            renamed.push(src);
        }
    }

    let new_names: Vec<&str> = new.iter().map(|c| c.name.as_str()).collect();
    let mut ops = Vec::new();

    // drops: old columns neither kept nor used as a rename source
    let mut surviving_old: Vec<&str> = Vec::new();
    for name in &old_names {
        if renamed.contains(name) || new_names.contains(name) {
            surviving_old.push(name);
        } else {
            ops.push(AlterOp::Drop { name: name.to_string() });
        }
    }

    // adds and changes, preserving declared order with AFTER clauses
    let old_defs: Vec<&str> = old.iter().map(|c| c.definition.as_str()).collect();
    let mut prev: Option<&RenderedColumn> = None;
    for col in new {
        if !primary_key.contains(&col.name) {
            let source = col.renamed_from.as_deref().unwrap_or(&col.name);
            let mut after = None;
            if let Some(prev_col) = prev {
                match surviving_old.iter().position(|n| *n == source) {
                    None => after = Some(prev_col.name.clone()),
                    Some(idx) => {
                        let prev_source = prev_col.renamed_from.as_deref().unwrap_or(&prev_col.name);
                        if idx >= 1 && surviving_old[idx - 1] != prev_source {
                            after = Some(prev_col.name.clone());
                        }
                    }
                }
            }
            let changed = !old_defs.contains(&col.definition.as_str());
            if changed || after.is_some() {
                ops.push(if !old_names.contains(&source) {
                    AlterOp::Add { definition: col.definition.clone(), after }
                } else if col.renamed_from.is_none() {
                    AlterOp::Modify { definition: col.definition.clone(), after }
                } else {
                    AlterOp::Change {
                        old_name: source.to_string(),
                        definition: col.definition.clone(),
                        after,
                    }
                });
            }
        }
        prev = Some(col);
    }
    Ok(ops)
}
