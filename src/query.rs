//! Declarative document selection.
//!
//! A [`Query`] is a conjunction of [`Predicate`]s. It is used both as a one-shot
//! selector and as a stage's standing subscription. Before evaluation a query is
//! compiled into a [`Filter`], which validates field names and pre-splits dotted
//! paths once instead of per document.
//!
//! The compact textual form (`touched(A,true);contents(title,true)`) covers the
//! `contents` and `touched` predicates only; the rest are reachable through the
//! structured (JSON) form.

use crate::data_model::{Action, Document};
use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const RESERVED: [char; 5] = ['(', ')', ',', ';', '\\'];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "predicate", rename_all = "camelCase")]
pub enum Predicate {
    ContentFieldExists { field: String },
    ContentFieldNotExists { field: String },
    ContentFieldEquals { field: String, value: Value },
    ContentFieldNotEquals { field: String, value: Value },
    MetadataFieldExists { field: String },
    MetadataFieldNotExists { field: String },
    MetadataFieldEquals { field: String, value: Value },
    MetadataFieldNotEquals { field: String, value: Value },
    TouchedByStage { stage: String },
    NotTouchedByStage { stage: String },
    NotFetchedByStage { stage: String },
    Action { action: Action },
    Id { id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub predicates: Vec<Predicate>,
}

impl Query {
    pub fn new() -> Self {
        Query::default()
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn with(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn content_exists(self, field: impl Into<String>) -> Self {
        self.with(Predicate::ContentFieldExists { field: field.into() })
    }

    pub fn content_not_exists(self, field: impl Into<String>) -> Self {
        self.with(Predicate::ContentFieldNotExists { field: field.into() })
    }

    pub fn content_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Predicate::ContentFieldEquals {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn content_not_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Predicate::ContentFieldNotEquals {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn metadata_exists(self, field: impl Into<String>) -> Self {
        self.with(Predicate::MetadataFieldExists { field: field.into() })
    }

    pub fn metadata_not_exists(self, field: impl Into<String>) -> Self {
        self.with(Predicate::MetadataFieldNotExists { field: field.into() })
    }

    pub fn metadata_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Predicate::MetadataFieldEquals {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn metadata_not_equals(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(Predicate::MetadataFieldNotEquals {
            field: field.into(),
            value: value.into(),
        })
    }

    pub fn touched(self, stage: impl Into<String>) -> Self {
        self.with(Predicate::TouchedByStage { stage: stage.into() })
    }

    pub fn not_touched(self, stage: impl Into<String>) -> Self {
        self.with(Predicate::NotTouchedByStage { stage: stage.into() })
    }

    pub fn not_fetched(self, stage: impl Into<String>) -> Self {
        self.with(Predicate::NotFetchedByStage { stage: stage.into() })
    }

    pub fn action(self, action: Action) -> Self {
        self.with(Predicate::Action { action })
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.with(Predicate::Id { id: id.into() })
    }

    /// Conjunction of two queries.
    pub fn and(mut self, other: Query) -> Self {
        self.predicates.extend(other.predicates);
        self
    }

    /// Order-independent predicate-set equality.
    pub fn same_predicates(&self, other: &Query) -> bool {
        self.predicates.iter().all(|p| other.predicates.contains(p))
            && other.predicates.iter().all(|p| self.predicates.contains(p))
    }

    pub fn compile(&self) -> Result<Filter> {
        let clauses = self
            .predicates
            .iter()
            .map(Clause::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Filter { clauses })
    }

    /// Parses the textual form. An empty (or all-whitespace) string is the empty query.
    pub fn parse(input: &str) -> Result<Query> {
        let tokens = tokenize(input)?;
        Parser { tokens, pos: 0, end: input.len() }.parse_query()
    }

    /// Parses and conjoins a list of textual fragments, as stored in `queryOptions`.
    pub fn parse_all<S: AsRef<str>>(fragments: &[S]) -> Result<Query> {
        fragments
            .iter()
            .try_fold(Query::new(), |acc, f| Ok(acc.and(Query::parse(f.as_ref())?)))
    }

    /// Serializes to the textual form, failing on anything the grammar cannot carry.
    pub fn to_query_string(&self) -> Result<String> {
        let mut parts = Vec::with_capacity(self.predicates.len());
        for predicate in &self.predicates {
            let (name, arg, flag) = match predicate {
                Predicate::ContentFieldExists { field } => ("contents", field, true),
                Predicate::ContentFieldNotExists { field } => ("contents", field, false),
                Predicate::TouchedByStage { stage } => ("touched", stage, true),
                Predicate::NotTouchedByStage { stage } => ("touched", stage, false),
                other => {
                    return Err(PipelineError::MalformedQuery(format!(
                        "predicate {:?} has no textual form",
                        other
                    )))
                }
            };
            check_textual_name(arg)?;
            parts.push(format!("{}({},{})", name, arg, flag));
        }
        Ok(parts.join(";"))
    }
}

fn check_textual_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PipelineError::MalformedQuery(
            "empty name cannot be serialized".to_string(),
        ));
    }
    if let Some(c) = name.chars().find(|c| RESERVED.contains(c)) {
        return Err(PipelineError::MalformedQuery(format!(
            "name '{}' contains reserved character '{}'",
            name, c
        )));
    }
    if name.trim() != name {
        return Err(PipelineError::MalformedQuery(format!(
            "name '{}' has surrounding whitespace",
            name
        )));
    }
    Ok(())
}

// --- Compiled form ---

#[derive(Debug, Clone)]
enum FieldTest {
    Exists,
    NotExists,
    Equals(Value),
    NotEquals(Value),
}

impl FieldTest {
    fn eval(&self, found: Option<&Value>) -> bool {
        match self {
            FieldTest::Exists => found.is_some(),
            FieldTest::NotExists => found.is_none(),
            FieldTest::Equals(v) => found.is_some_and(|f| value_matches(f, v)),
            // A missing field is "not equal".
            FieldTest::NotEquals(v) => !found.is_some_and(|f| value_matches(f, v)),
        }
    }
}

/// Equality where an array field also matches any of its elements.
fn value_matches(field: &Value, expected: &Value) -> bool {
    if field == expected {
        return true;
    }
    match (field, expected) {
        (Value::Array(items), e) if !e.is_array() => items.contains(e),
        _ => false,
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Content(Vec<String>, FieldTest),
    Metadata(Vec<String>, FieldTest),
    Touched(String, bool),
    NotFetched(String),
    Action(Action),
    Id(String),
}

impl Clause {
    fn compile(predicate: &Predicate) -> Result<Clause> {
        Ok(match predicate {
            Predicate::ContentFieldExists { field } => Clause::Content(split_path(field)?, FieldTest::Exists),
            Predicate::ContentFieldNotExists { field } => {
                Clause::Content(split_path(field)?, FieldTest::NotExists)
            }
            Predicate::ContentFieldEquals { field, value } => {
                Clause::Content(split_path(field)?, FieldTest::Equals(value.clone()))
            }
            Predicate::ContentFieldNotEquals { field, value } => {
                Clause::Content(split_path(field)?, FieldTest::NotEquals(value.clone()))
            }
            Predicate::MetadataFieldExists { field } => Clause::Metadata(split_path(field)?, FieldTest::Exists),
            Predicate::MetadataFieldNotExists { field } => {
                Clause::Metadata(split_path(field)?, FieldTest::NotExists)
            }
            Predicate::MetadataFieldEquals { field, value } => {
                Clause::Metadata(split_path(field)?, FieldTest::Equals(value.clone()))
            }
            Predicate::MetadataFieldNotEquals { field, value } => {
                Clause::Metadata(split_path(field)?, FieldTest::NotEquals(value.clone()))
            }
            Predicate::TouchedByStage { stage } => Clause::Touched(non_empty_stage(stage)?, true),
            Predicate::NotTouchedByStage { stage } => Clause::Touched(non_empty_stage(stage)?, false),
            Predicate::NotFetchedByStage { stage } => Clause::NotFetched(non_empty_stage(stage)?),
            Predicate::Action { action } => Clause::Action(*action),
            Predicate::Id { id } => Clause::Id(id.clone()),
        })
    }

    fn matches(&self, doc: &Document) -> bool {
        match self {
            Clause::Content(path, test) => test.eval(doc.content_field(path)),
            Clause::Metadata(path, test) => test.eval(doc.metadata_field(path).as_ref()),
            Clause::Touched(stage, expected) => doc.is_touched_by(stage) == *expected,
            Clause::NotFetched(stage) => !doc.is_fetched_by(stage),
            Clause::Action(action) => doc.action == *action,
            Clause::Id(id) => doc.id == *id,
        }
    }
}

fn split_path(field: &str) -> Result<Vec<String>> {
    let segments: Vec<String> = field.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(PipelineError::MalformedQuery(format!(
            "invalid field path '{}'",
            field
        )));
    }
    Ok(segments)
}

fn non_empty_stage(stage: &str) -> Result<String> {
    if stage.trim().is_empty() {
        return Err(PipelineError::MalformedQuery("empty stage name".to_string()));
    }
    Ok(stage.to_string())
}

/// A validated, ready-to-evaluate conjunction.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    /// Matches everything.
    pub fn all() -> Self {
        Filter::default()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|c| c.matches(doc))
    }
}

// --- Textual grammar ---
//
// query     := ws | predicate (';' predicate)* ';'?
// predicate := word '(' word ',' word ')'
// A backslash escapes the next character; unescaped whitespace around words is dropped.

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Word(String),
    Open,
    Comma,
    Close,
    Semi,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    // (char, escaped) pairs of the word being built
    let mut word: Vec<(char, bool)> = Vec::new();
    let mut word_start = 0;
    let mut chars = input.char_indices();

    fn flush(word: &mut Vec<(char, bool)>, start: usize, tokens: &mut Vec<Token>) {
        let is_pad = |&(c, escaped): &(char, bool)| c.is_whitespace() && !escaped;
        let first = word.iter().position(|p| !is_pad(p));
        let last = word.iter().rposition(|p| !is_pad(p));
        if let (Some(first), Some(last)) = (first, last) {
            let text: String = word[first..=last].iter().map(|(c, _)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Word(text),
                offset: start,
            });
        }
        word.clear();
    }

    while let Some((offset, c)) = chars.next() {
        let structural = match c {
            '(' => Some(TokenKind::Open),
            ',' => Some(TokenKind::Comma),
            ')' => Some(TokenKind::Close),
            ';' => Some(TokenKind::Semi),
            _ => None,
        };
        if let Some(kind) = structural {
            flush(&mut word, word_start, &mut tokens);
            tokens.push(Token { kind, offset });
            continue;
        }
        if word.is_empty() {
            word_start = offset;
        }
        if c == '\\' {
            match chars.next() {
                Some((_, escaped)) => word.push((escaped, true)),
                None => {
                    return Err(PipelineError::MalformedQuery(format!(
                        "dangling escape at offset {}",
                        offset
                    )))
                }
            }
        } else {
            word.push((c, false));
        }
    }
    flush(&mut word, word_start, &mut tokens);
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn offset(&self) -> usize {
        self.peek().map(|t| t.offset).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<()> {
        let offset = self.offset();
        match self.next() {
            Some(t) if t.kind == kind => Ok(()),
            Some(t) => Err(PipelineError::MalformedQuery(format!(
                "expected {} at offset {}, found {:?}",
                what, offset, t.kind
            ))),
            None => Err(PipelineError::MalformedQuery(format!(
                "expected {} at offset {}, found end of input",
                what, offset
            ))),
        }
    }

    fn word(&mut self, what: &str) -> Result<(String, usize)> {
        let offset = self.offset();
        match self.next() {
            Some(Token {
                kind: TokenKind::Word(w),
                offset,
            }) => Ok((w, offset)),
            _ => Err(PipelineError::MalformedQuery(format!(
                "expected {} at offset {}",
                what, offset
            ))),
        }
    }

    fn parse_query(mut self) -> Result<Query> {
        let mut query = Query::new();
        while self.peek().is_some() {
            query.predicates.push(self.parse_predicate()?);
            match self.next() {
                None => break,
                Some(Token {
                    kind: TokenKind::Semi,
                    ..
                }) => {}
                Some(t) => {
                    return Err(PipelineError::MalformedQuery(format!(
                        "expected ';' at offset {}, found {:?}",
                        t.offset, t.kind
                    )))
                }
            }
        }
        Ok(query)
    }

    fn parse_predicate(&mut self) -> Result<Predicate> {
        let (name, name_offset) = self.word("predicate name")?;
        self.expect(TokenKind::Open, "'('")?;
        let (arg, _) = self.word("name argument")?;
        self.expect(TokenKind::Comma, "','")?;
        let (flag, flag_offset) = self.word("boolean argument")?;
        self.expect(TokenKind::Close, "')'")?;

        let flag = if flag.eq_ignore_ascii_case("true") {
            true
        } else if flag.eq_ignore_ascii_case("false") {
            false
        } else {
            return Err(PipelineError::MalformedQuery(format!(
                "expected true or false at offset {}, found '{}'",
                flag_offset, flag
            )));
        };

        match (name.as_str(), flag) {
            ("contents", true) => Ok(Predicate::ContentFieldExists { field: arg }),
            ("contents", false) => Ok(Predicate::ContentFieldNotExists { field: arg }),
            ("touched", true) => Ok(Predicate::TouchedByStage { stage: arg }),
            ("touched", false) => Ok(Predicate::NotTouchedByStage { stage: arg }),
            _ => Err(PipelineError::MalformedQuery(format!(
                "unknown predicate '{}' at offset {}",
                name, name_offset
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    #[test]
    fn test_parse_basic() {
        let q = Query::parse("touched(stageA,true);contents(fieldX,true)").unwrap();
        let expected = Query::new().touched("stageA").content_exists("fieldX");
        assert!(q.same_predicates(&expected));
    }

    #[test]
    fn test_parse_trailing_semicolon_and_whitespace() {
        let q = Query::parse(" touched( A , false ) ; contents(b,FALSE); ").unwrap();
        let expected = Query::new().not_touched("A").content_not_exists("b");
        assert!(q.same_predicates(&expected));
    }

    #[test]
    fn test_parse_empty() {
        assert!(Query::parse("").unwrap().is_empty());
        assert!(Query::parse("   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_escapes() {
        let q = Query::parse(r"contents(a\,b\)c,true)").unwrap();
        assert_eq!(
            q.predicates,
            vec![Predicate::ContentFieldExists {
                field: "a,b)c".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let cases = [
            "touched(A,true",
            "touched(A)",
            "touched A,true)",
            "touched(A,yes)",
            "bogus(A,true)",
            "touched(A,true);;contents(b,true)",
            "touched(A,true) contents(b,true)",
            "contents(,true)",
            r"contents(a,true)\",
        ];
        for case in cases {
            match Query::parse(case) {
                Err(PipelineError::MalformedQuery(msg)) => {
                    assert!(msg.contains("offset"), "no offset in '{}' for {}", msg, case)
                }
                other => panic!("Expected MalformedQuery for {:?}, got {:?}", case, other),
            }
        }
    }

    #[test]
    fn test_round_trip() {
        let q = Query::new()
            .content_exists("title")
            .touched("hasher")
            .content_not_exists("body.text")
            .not_touched("writer");
        let text = q.to_query_string().unwrap();
        let back = Query::parse(&text).unwrap();
        assert!(back.same_predicates(&q));
    }

    fn random_name(rng: &mut StdRng) -> String {
        const ALPHABET: &[char] = &[
            'a', 'b', 'z', 'Q', '0', '7', '_', '-', ' ', 'é', 'ø', 'ß', '中', 'Ж', '$', '@', '\'', '"',
        ];
        let segments = rng.gen_range(1..=3);
        let mut parts = Vec::with_capacity(segments);
        for _ in 0..segments {
            let len = rng.gen_range(1..=6);
            let mut segment: String = (0..len)
                .map(|_| *ALPHABET.choose(rng).unwrap())
                .collect();
            if segment.trim().is_empty() {
                segment.push('x');
            }
            parts.push(segment);
        }
        let name = parts.join(".");
        let trimmed = name.trim();
        if trimmed.is_empty() || trimmed.starts_with('.') || trimmed.ends_with('.') {
            format!("n{}n", name)
        } else {
            trimmed.to_string()
        }
    }

    #[test]
    fn test_generated_round_trips() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let mut q = Query::new();
            for _ in 0..rng.gen_range(0..=5) {
                let name = random_name(&mut rng);
                q = match rng.gen_range(0..4) {
                    0 => q.content_exists(name),
                    1 => q.content_not_exists(name),
                    2 => q.touched(name),
                    _ => q.not_touched(name),
                };
            }
            let text = q.to_query_string().unwrap();
            let back = Query::parse(&text)
                .unwrap_or_else(|e| panic!("'{}' did not parse: {}", text, e));
            assert!(back.same_predicates(&q), "round trip changed '{}'", text);
        }
    }

    #[test]
    fn test_serialize_fails_fast() {
        let reserved = Query::new().content_exists("a;b");
        assert!(matches!(
            reserved.to_query_string(),
            Err(PipelineError::MalformedQuery(_))
        ));
        let unsupported = Query::new().content_equals("a", 1);
        assert!(matches!(
            unsupported.to_query_string(),
            Err(PipelineError::MalformedQuery(_))
        ));
        let empty = Query::new().touched("");
        assert!(empty.to_query_string().is_err());
    }

    #[test]
    fn test_compile_rejects_bad_paths() {
        assert!(Query::new().content_exists("a..b").compile().is_err());
        assert!(Query::new().metadata_exists("").compile().is_err());
        assert!(Query::new().not_fetched(" ").compile().is_err());
    }

    #[test]
    fn test_filter_semantics() {
        let doc = Document::from_value(json!({"a": 1, "tags": ["x", "y"], "n": {"m": "v"}}))
            .with_id("d1")
            .with_action(Action::Update);

        let check = |q: Query| q.compile().unwrap().matches(&doc);
        assert!(check(Query::new()));
        assert!(check(Query::new().content_exists("a").content_equals("n.m", "v")));
        assert!(check(Query::new().content_equals("tags", "x")));
        assert!(!check(Query::new().content_not_equals("tags", "y")));
        assert!(check(Query::new().content_not_equals("missing", 3)));
        assert!(!check(Query::new().content_equals("a", 2)));
        assert!(check(Query::new().action(Action::Update).id("d1")));
        assert!(!check(Query::new().action(Action::Delete)));
        assert!(check(Query::new().not_touched("A").not_fetched("A")));
        assert!(!check(Query::new().touched("A")));
        assert!(check(Query::new().metadata_not_exists("source")));
    }

    #[test]
    fn test_structured_json_form() {
        let q = Query::new().content_equals("a", 1).not_fetched("S");
        let wire = serde_json::to_value(&q).unwrap();
        assert_eq!(wire["predicates"][0]["predicate"], json!("contentFieldEquals"));
        let back: Query = serde_json::from_value(wire).unwrap();
        assert_eq!(back, q);
    }
}
