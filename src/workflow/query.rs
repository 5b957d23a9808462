/// List query language for workflows
///
/// Parses the `filter` and `order_by` strings accepted by ListWorkflows and
/// defines the keyset cursor carried inside page tokens.
///
/// Filter grammar: terms joined by `AND`, where a term is `field = value`,
/// `field != value` or `labels.<key>:*` (label presence). Fields are `state`,
/// `name`, `description`, `service_account` and `labels.<key>`. Values are bare
/// words or double-quoted strings.

use crate::error::{LifecycleError, Result};
use crate::workflow::types::{Workflow, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A parsed filter expression; the empty filter matches everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    terms: Vec<Term>,
}

#[derive(Debug, Clone, PartialEq)]
enum Term {
    State { negate: bool, state: WorkflowState },
    Text { negate: bool, field: TextField, value: String },
    HasLabel(String),
}

#[derive(Debug, Clone, PartialEq)]
enum TextField {
    Name,
    Description,
    ServiceAccount,
    Label(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Quoted(String),
    Eq,
    Ne,
    Colon,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut terms = Vec::new();
        let mut rest = tokens.as_slice();

        while !rest.is_empty() {
            let (term, remaining) = parse_term(rest)?;
            terms.push(term);
            rest = remaining;
            match rest.first() {
                None => break,
                Some(Token::Word(word)) if word == "AND" => {
                    rest = &rest[1..];
                    if rest.is_empty() {
                        return Err(malformed("dangling AND"));
                    }
                }
                Some(other) => return Err(malformed(&format!("unexpected {:?}", other))),
            }
        }

        Ok(Self { terms })
    }

    pub fn matches(&self, workflow: &Workflow) -> bool {
        self.terms.iter().all(|term| term.matches(workflow))
    }
}

impl Term {
    fn matches(&self, workflow: &Workflow) -> bool {
        match self {
            Term::State { negate, state } => (workflow.state == *state) != *negate,
            Term::HasLabel(key) => workflow.labels.contains_key(key),
            Term::Text { negate, field, value } => {
                let actual = match field {
                    TextField::Name => Some(workflow.name.as_str()),
                    TextField::Description => Some(workflow.description.as_str()),
                    TextField::ServiceAccount => Some(workflow.service_account.as_str()),
                    TextField::Label(key) => workflow.labels.get(key).map(String::as_str),
                };
                (actual == Some(value.as_str())) != *negate
            }
        }
    }
}

fn malformed(detail: &str) -> LifecycleError {
    LifecycleError::invalid(format!("malformed filter: {}", detail))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            '!' => {
                chars.next();
                if chars.next() != Some('=') {
                    return Err(malformed("expected '!='"));
                }
                tokens.push(Token::Ne);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(malformed("unterminated string")),
                        },
                        Some(other) => value.push(other),
                        None => return Err(malformed("unterminated string")),
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '=' | '!' | ':' | '"') {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

fn parse_term(tokens: &[Token]) -> Result<(Term, &[Token])> {
    let field = match tokens.first() {
        Some(Token::Word(word)) => word.as_str(),
        _ => return Err(malformed("expected a field name")),
    };
    let op = tokens.get(1).ok_or_else(|| malformed("expected an operator"))?;
    let value = match tokens.get(2) {
        Some(Token::Word(word)) | Some(Token::Quoted(word)) => word.clone(),
        _ => return Err(malformed(&format!("expected a value after '{}'", field))),
    };
    let rest = &tokens[3..];

    let negate = match op {
        Token::Eq => false,
        Token::Ne => true,
        Token::Colon => {
            let key = field
                .strip_prefix("labels.")
                .filter(|key| !key.is_empty())
                .ok_or_else(|| malformed("':' is only supported as labels.<key>:*"))?;
            if value != "*" {
                return Err(malformed("':' is only supported as labels.<key>:*"));
            }
            return Ok((Term::HasLabel(key.to_string()), rest));
        }
        other => return Err(malformed(&format!("expected an operator, found {:?}", other))),
    };

    let term = match field {
        "state" => Term::State {
            negate,
            state: value.parse()?,
        },
        "name" => Term::Text { negate, field: TextField::Name, value },
        "description" => Term::Text { negate, field: TextField::Description, value },
        "service_account" | "serviceAccount" => Term::Text {
            negate,
            field: TextField::ServiceAccount,
            value,
        },
        other => match other.strip_prefix("labels.") {
            Some(key) if !key.is_empty() => Term::Text {
                negate,
                field: TextField::Label(key.to_string()),
                value,
            },
            _ => return Err(malformed(&format!("unknown field '{}'", other))),
        },
    };

    Ok((term, rest))
}

/// Sort order for workflow listings; ties always break by name ascending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    key: SortField,
    descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortField {
    Name,
    CreateTime,
    UpdateTime,
    VersionId,
}

/// Value of the sort field for one workflow, as stored in a cursor
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortValue {
    Text(String),
    Time(DateTime<Utc>),
    Number(u64),
}

impl Default for OrderBy {
    fn default() -> Self {
        Self {
            key: SortField::Name,
            descending: false,
        }
    }
}

impl OrderBy {
    pub fn parse(input: &str) -> Result<Self> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let (field, direction) = match parts.as_slice() {
            [] => return Ok(Self::default()),
            [field] => (*field, None),
            [field, direction] => (*field, Some(*direction)),
            _ => return Err(LifecycleError::invalid(format!("malformed order_by '{}'", input))),
        };

        let key = match field {
            "name" => SortField::Name,
            "create_time" | "createTime" => SortField::CreateTime,
            "update_time" | "updateTime" => SortField::UpdateTime,
            "version_id" | "versionId" => SortField::VersionId,
            other => {
                return Err(LifecycleError::invalid(format!("cannot order by '{}'", other)))
            }
        };
        let descending = match direction {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(other) => {
                return Err(LifecycleError::invalid(format!("unknown sort direction '{}'", other)))
            }
        };

        Ok(Self { key, descending })
    }

    pub fn sort_value(&self, workflow: &Workflow) -> SortValue {
        match self.key {
            SortField::Name => SortValue::Text(workflow.name.clone()),
            SortField::CreateTime => SortValue::Time(workflow.create_time),
            SortField::UpdateTime => SortValue::Time(workflow.update_time),
            SortField::VersionId => SortValue::Number(workflow.version_id),
        }
    }

    fn order_keys(&self, a: (&SortValue, &str), b: (&SortValue, &str)) -> Ordering {
        let primary = if self.descending { b.0.cmp(a.0) } else { a.0.cmp(b.0) };
        primary.then_with(|| a.1.cmp(b.1))
    }

    pub fn compare(&self, a: &Workflow, b: &Workflow) -> Ordering {
        self.order_keys(
            (&self.sort_value(a), a.name.as_str()),
            (&self.sort_value(b), b.name.as_str()),
        )
    }

    /// True when `workflow` sorts strictly after the cursor position
    pub fn is_after(&self, workflow: &Workflow, cursor: &WorkflowCursor) -> bool {
        self.order_keys(
            (&self.sort_value(workflow), workflow.name.as_str()),
            (&cursor.key, cursor.name.as_str()),
        ) == Ordering::Greater
    }
}

/// Resumption point embedded in a ListWorkflows page token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCursor {
    /// Canonical form of the query the token was issued for
    pub query: String,
    pub key: SortValue,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::SourceCode;
    use std::collections::BTreeMap;

    fn workflow(name: &str, state: WorkflowState, labels: &[(&str, &str)], version_id: u64) -> Workflow {
        let now = Utc::now();
        Workflow {
            name: format!("projects/p/locations/l/workflows/{}", name),
            description: String::new(),
            source_code: SourceCode::SourceContents("steps: []".to_string()),
            state,
            version_id,
            revision_id: String::new(),
            create_time: now,
            update_time: now,
            revision_create_time: now,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            service_account: "sa@example.com".to_string(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = Filter::parse("   ").unwrap();
        assert!(filter.matches(&workflow("a", WorkflowState::Failed, &[], 1)));
    }

    #[test]
    fn state_and_label_terms_combine() {
        let filter = Filter::parse(r#"state = ACTIVE AND labels.env = "prod""#).unwrap();
        assert!(filter.matches(&workflow("a", WorkflowState::Active, &[("env", "prod")], 1)));
        assert!(!filter.matches(&workflow("b", WorkflowState::Failed, &[("env", "prod")], 1)));
        assert!(!filter.matches(&workflow("c", WorkflowState::Active, &[("env", "dev")], 1)));
    }

    #[test]
    fn negation_and_presence() {
        let filter = Filter::parse("state!=FAILED AND labels.team:*").unwrap();
        assert!(filter.matches(&workflow("a", WorkflowState::Active, &[("team", "x")], 1)));
        assert!(!filter.matches(&workflow("b", WorkflowState::Active, &[], 1)));
        assert!(!filter.matches(&workflow("c", WorkflowState::Failed, &[("team", "x")], 1)));
    }

    #[test]
    fn malformed_filters_are_rejected() {
        for bad in [
            "state",
            "state =",
            "state = RUNNING",
            "color = red",
            "state = ACTIVE AND",
            "state = ACTIVE OR state = FAILED",
            r#"labels.env = "prod"#,
            "name:*",
            "labels.env:prod",
        ] {
            let err = Filter::parse(bad).unwrap_err();
            assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument, "{}", bad);
        }
    }

    #[test]
    fn order_by_parsing() {
        assert_eq!(OrderBy::parse("").unwrap(), OrderBy::default());
        assert!(OrderBy::parse("version_id desc").is_ok());
        assert!(OrderBy::parse("createTime").is_ok());
        assert!(OrderBy::parse("labels").is_err());
        assert!(OrderBy::parse("name sideways").is_err());
    }

    #[test]
    fn descending_version_breaks_ties_by_name() {
        let order = OrderBy::parse("version_id desc").unwrap();
        let mut items = vec![
            workflow("b", WorkflowState::Active, &[], 1),
            workflow("a", WorkflowState::Active, &[], 1),
            workflow("c", WorkflowState::Active, &[], 3),
        ];
        items.sort_by(|a, b| order.compare(a, b));
        let names: Vec<_> = items.iter().map(|w| w.name.rsplit('/').next().unwrap()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);

        let cursor = WorkflowCursor {
            query: String::new(),
            key: SortValue::Number(1),
            name: items[1].name.clone(),
        };
        assert!(order.is_after(&items[2], &cursor));
        assert!(!order.is_after(&items[0], &cursor));
    }
}
