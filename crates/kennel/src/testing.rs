//! Test utilities for the kennel crate
//!
//! Reusable doubles for unit and integration testing: an in-memory
//! `DocumentStore` that understands the subset of the query language the
//! repository emits, a counting `StoreConnector` and a fixed `TokenSource`.

use crate::db::{
    AccessToken, ContainerRef, ContainerSpec, Credential, CredentialMode, DocumentStore,
    Provisioned, QueryOptions, QuerySpec, StoreConnector, StoreError, StoreResult, TokenSource,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Container {
    throughput: Option<u32>,
    documents: Vec<Value>,
}

#[derive(Default)]
struct Account {
    databases: HashSet<String>,
    containers: HashMap<ContainerRef, Container>,
}

#[derive(Default)]
struct Failures {
    query: Option<StoreError>,
    database: Option<StoreError>,
    container: Option<StoreError>,
    /// Successful item creates allowed before `create_error` kicks in
    creates_before_failure: Option<usize>,
    create_error: Option<StoreError>,
}

/// In-memory document store.
///
/// Thread-safe via Mutex. Stored documents gain `_rid`, `_self`, `_etag`,
/// `_attachments` and `_ts` like the real service.
#[derive(Default)]
pub struct MemoryStore {
    account: Mutex<Account>,
    failures: Mutex<Failures>,
    queries: Mutex<Vec<QuerySpec>>,
    database_creations: AtomicUsize,
    container_creations: AtomicUsize,
    item_creates: AtomicUsize,
    writes: AtomicUsize,
    sequence: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the database and container already provisioned
    pub fn with_container(database: &str, container: &str) -> Self {
        let store = Self::new();
        {
            let mut account = store.account.lock().unwrap();
            account.databases.insert(database.to_string());
            account
                .containers
                .insert(ContainerRef::new(database, container), Container::default());
        }
        store
    }

    /// Every query fails with `err` until cleared
    pub fn fail_queries_with(&self, err: StoreError) {
        self.failures.lock().unwrap().query = Some(err);
    }

    pub fn clear_query_failure(&self) {
        self.failures.lock().unwrap().query = None;
    }

    pub fn fail_database_creation_with(&self, err: StoreError) {
        self.failures.lock().unwrap().database = Some(err);
    }

    pub fn fail_container_creation_with(&self, err: StoreError) {
        self.failures.lock().unwrap().container = Some(err);
    }

    /// Let `successes` item creates through, then fail every later one with `err`
    pub fn fail_creates_after(&self, successes: usize, err: StoreError) {
        let mut failures = self.failures.lock().unwrap();
        failures.creates_before_failure = Some(successes);
        failures.create_error = Some(err);
    }

    /// Store a raw document, bypassing validation
    pub fn insert_raw(&self, target: &ContainerRef, document: Value) {
        let mut account = self.account.lock().unwrap();
        account
            .containers
            .entry(target.clone())
            .or_default()
            .documents
            .push(document);
    }

    /// Stored documents of a container, in insertion order
    pub fn documents(&self, target: &ContainerRef) -> Vec<Value> {
        self.account
            .lock()
            .unwrap()
            .containers
            .get(target)
            .map(|container| container.documents.clone())
            .unwrap_or_default()
    }

    pub fn has_container(&self, target: &ContainerRef) -> bool {
        self.account.lock().unwrap().containers.contains_key(target)
    }

    /// `None` when the container does not exist
    pub fn container_throughput(&self, target: &ContainerRef) -> Option<Option<u32>> {
        self.account
            .lock()
            .unwrap()
            .containers
            .get(target)
            .map(|container| container.throughput)
    }

    pub fn database_creations(&self) -> usize {
        self.database_creations.load(AtomicOrdering::SeqCst)
    }

    pub fn container_creations(&self) -> usize {
        self.container_creations.load(AtomicOrdering::SeqCst)
    }

    /// Successful creates, replaces and deletes
    pub fn write_count(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }

    pub fn last_query(&self) -> Option<QuerySpec> {
        self.queries.lock().unwrap().last().cloned()
    }

    fn with_system_properties(&self, container: &ContainerRef, item: &Value) -> Value {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::SeqCst);
        let mut document = item.clone();
        if let Value::Object(map) = &mut document {
            let id = map
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            map.insert("_rid".into(), Value::from(format!("rid{:08}", sequence)));
            map.insert("_self".into(), Value::from(container.document_link(&id)));
            map.insert("_etag".into(), Value::from(format!("\"{:08x}\"", sequence)));
            map.insert("_attachments".into(), Value::from("attachments/"));
            map.insert("_ts".into(), Value::from(Utc::now().timestamp()));
        }
        document
    }
}

fn missing(container: &ContainerRef) -> StoreError {
    StoreError::NotFound(format!("container {} does not exist", container))
}

fn document_id(document: &Value) -> Option<&str> {
    document.get("id").and_then(Value::as_str)
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn create_database_if_not_exists(&self, database: &str) -> StoreResult<Provisioned> {
        if let Some(err) = self.failures.lock().unwrap().database.clone() {
            return Err(err);
        }
        let mut account = self.account.lock().unwrap();
        if account.databases.insert(database.to_string()) {
            self.database_creations.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(Provisioned::Created)
        } else {
            Ok(Provisioned::Existing)
        }
    }

    async fn create_container_if_not_exists(
        &self,
        database: &str,
        spec: &ContainerSpec,
    ) -> StoreResult<Provisioned> {
        if let Some(err) = self.failures.lock().unwrap().container.clone() {
            return Err(err);
        }
        let mut account = self.account.lock().unwrap();
        if !account.databases.contains(database) {
            return Err(StoreError::NotFound(format!(
                "database {} does not exist",
                database
            )));
        }
        let target = ContainerRef::new(database, spec.id.as_str());
        if account.containers.contains_key(&target) {
            return Ok(Provisioned::Existing);
        }
        account.containers.insert(
            target,
            Container {
                throughput: spec.throughput,
                documents: Vec::new(),
            },
        );
        self.container_creations.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Provisioned::Created)
    }

    async fn create_item(&self, container: &ContainerRef, item: &Value) -> StoreResult<Value> {
        {
            let failures = self.failures.lock().unwrap();
            if let (Some(allowed), Some(err)) =
                (failures.creates_before_failure, &failures.create_error)
            {
                if self.item_creates.load(AtomicOrdering::SeqCst) >= allowed {
                    return Err(err.clone());
                }
            }
        }

        let id = document_id(item)
            .ok_or_else(|| StoreError::Status {
                status: 400,
                message: "document has no string id".to_string(),
            })?
            .to_string();
        let document = self.with_system_properties(container, item);

        let mut account = self.account.lock().unwrap();
        let target = account
            .containers
            .get_mut(container)
            .ok_or_else(|| missing(container))?;
        if target
            .documents
            .iter()
            .any(|existing| document_id(existing) == Some(id.as_str()))
        {
            return Err(StoreError::Conflict(format!("document {} already exists", id)));
        }
        target.documents.push(document.clone());

        self.item_creates.fetch_add(1, AtomicOrdering::SeqCst);
        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(document)
    }

    async fn read_item(
        &self,
        container: &ContainerRef,
        id: &str,
        _partition_key: &str,
    ) -> StoreResult<Value> {
        let account = self.account.lock().unwrap();
        let target = account
            .containers
            .get(container)
            .ok_or_else(|| missing(container))?;
        target
            .documents
            .iter()
            .find(|document| document_id(document) == Some(id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("document {} does not exist", id)))
    }

    async fn replace_item(
        &self,
        container: &ContainerRef,
        id: &str,
        _partition_key: &str,
        item: &Value,
    ) -> StoreResult<Value> {
        let document = self.with_system_properties(container, item);

        let mut account = self.account.lock().unwrap();
        let target = account
            .containers
            .get_mut(container)
            .ok_or_else(|| missing(container))?;
        let slot = target
            .documents
            .iter_mut()
            .find(|existing| document_id(existing) == Some(id))
            .ok_or_else(|| StoreError::NotFound(format!("document {} does not exist", id)))?;
        *slot = document.clone();

        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(document)
    }

    async fn delete_item(
        &self,
        container: &ContainerRef,
        id: &str,
        _partition_key: &str,
    ) -> StoreResult<()> {
        let mut account = self.account.lock().unwrap();
        let target = account
            .containers
            .get_mut(container)
            .ok_or_else(|| missing(container))?;
        let before = target.documents.len();
        target
            .documents
            .retain(|document| document_id(document) != Some(id));
        if target.documents.len() == before {
            return Err(StoreError::NotFound(format!("document {} does not exist", id)));
        }

        self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn query_items(
        &self,
        container: &ContainerRef,
        query: &QuerySpec,
        options: QueryOptions,
    ) -> StoreResult<Vec<Value>> {
        self.queries.lock().unwrap().push(query.clone());
        if let Some(err) = self.failures.lock().unwrap().query.clone() {
            return Err(err);
        }

        let parsed = Parser::new(tokenize(&query.query)?, query).query()?;
        // Like the gateway: ordered or paged cross-partition queries need a client-side merge
        if options.cross_partition && options.window.is_none() && parsed.needs_merge() {
            return Err(bad_request(
                "Cross partition query with TOP, ORDER BY or OFFSET/LIMIT \
                 can not be directly served by the gateway",
            ));
        }

        let documents = {
            let account = self.account.lock().unwrap();
            account
                .containers
                .get(container)
                .ok_or_else(|| missing(container))?
                .documents
                .clone()
        };
        let mut rows = parsed.run(documents);
        if let (true, Some(count)) = (options.single_page, options.max_item_count) {
            rows.truncate(count as usize);
        }
        Ok(rows)
    }
}

// -- Query interpreter --

fn bad_request(message: impl Into<String>) -> StoreError {
    StoreError::Status {
        status: 400,
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Param(String),
    Number(f64),
    Symbol(&'static str),
}

fn tokenize(text: &str) -> StoreResult<Vec<Token>> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch.is_whitespace() {
            i += 1;
        } else if ch.is_ascii_alphabetic() || ch == '_' || ch == '@' {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            if word.starts_with('@') {
                tokens.push(Token::Param(word));
            } else {
                tokens.push(Token::Ident(word));
            }
        } else if ch.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let literal: String = chars[start..i].iter().collect();
            let number = literal
                .parse()
                .map_err(|_| bad_request(format!("invalid number {}", literal)))?;
            tokens.push(Token::Number(number));
        } else {
            let next = chars.get(i + 1).copied();
            let symbol = match (ch, next) {
                ('!', Some('=')) | ('<', Some('>')) => "!=",
                ('<', Some('=')) => "<=",
                ('>', Some('=')) => ">=",
                ('(', _) => "(",
                (')', _) => ")",
                (',', _) => ",",
                ('.', _) => ".",
                ('*', _) => "*",
                ('=', _) => "=",
                ('<', _) => "<",
                ('>', _) => ">",
                ('\'', _) | ('"', _) => {
                    return Err(bad_request("string literals are not supported"))
                },
                _ => return Err(bad_request(format!("unexpected character '{}'", ch))),
            };
            i += symbol.len();
            tokens.push(Token::Symbol(symbol));
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
enum Operand {
    Field(String),
    Literal(Value),
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Contains(Operand, Operand),
    Compare(Operand, Comparison, Operand),
}

#[derive(Debug, Default)]
struct Query {
    top: Option<usize>,
    projection: Option<Vec<String>>,
    filter: Option<Expr>,
    order: Option<(String, bool)>,
    offset: Option<usize>,
    limit: Option<usize>,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    spec: &'a QuerySpec,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token>, spec: &'a QuerySpec) -> Self {
        Self {
            tokens,
            pos: 0,
            spec,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn keyword(&mut self, word: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(ident)) if ident.eq_ignore_ascii_case(word) => {
                self.pos += 1;
                true
            },
            _ => false,
        }
    }

    fn expect_keyword(&mut self, word: &str) -> StoreResult<()> {
        if self.keyword(word) {
            Ok(())
        } else {
            Err(bad_request(format!("expected {}", word)))
        }
    }

    fn symbol(&mut self, symbol: &str) -> bool {
        match self.peek() {
            Some(Token::Symbol(s)) if *s == symbol => {
                self.pos += 1;
                true
            },
            _ => false,
        }
    }

    fn expect_symbol(&mut self, symbol: &str) -> StoreResult<()> {
        if self.symbol(symbol) {
            Ok(())
        } else {
            Err(bad_request(format!("expected '{}'", symbol)))
        }
    }

    fn parameter(&self, name: &str) -> StoreResult<Value> {
        self.spec
            .parameter(name)
            .cloned()
            .ok_or_else(|| bad_request(format!("parameter {} is not bound", name)))
    }

    fn count(&mut self) -> StoreResult<usize> {
        let value = match self.advance() {
            Some(Token::Number(number)) => Value::from(number),
            Some(Token::Param(name)) => self.parameter(&name)?,
            _ => return Err(bad_request("expected a count")),
        };
        value
            .as_u64()
            .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .map(|count| count as usize)
            .ok_or_else(|| bad_request("count must be a non-negative integer"))
    }

    fn field(&mut self) -> StoreResult<String> {
        match (self.advance(), self.advance(), self.advance()) {
            (Some(Token::Ident(_)), Some(Token::Symbol(".")), Some(Token::Ident(name))) => Ok(name),
            _ => Err(bad_request("expected a property path")),
        }
    }

    fn query(mut self) -> StoreResult<Query> {
        let mut query = Query::default();
        self.expect_keyword("SELECT")?;
        if self.keyword("TOP") {
            query.top = Some(self.count()?);
        }
        if !self.symbol("*") {
            let mut fields = vec![self.field()?];
            while self.symbol(",") {
                fields.push(self.field()?);
            }
            query.projection = Some(fields);
        }
        self.expect_keyword("FROM")?;
        match self.advance() {
            Some(Token::Ident(_)) => {},
            _ => return Err(bad_request("expected a collection alias")),
        }
        if self.keyword("WHERE") {
            query.filter = Some(self.or_expr()?);
        }
        if self.keyword("ORDER") {
            self.expect_keyword("BY")?;
            let field = self.field()?;
            let descending = if self.keyword("DESC") {
                true
            } else {
                self.keyword("ASC");
                false
            };
            query.order = Some((field, descending));
        }
        if self.keyword("OFFSET") {
            query.offset = Some(self.count()?);
            self.expect_keyword("LIMIT")?;
            query.limit = Some(self.count()?);
        }
        if self.pos != self.tokens.len() {
            return Err(bad_request("unexpected trailing tokens"));
        }
        Ok(query)
    }

    fn or_expr(&mut self) -> StoreResult<Expr> {
        let mut left = self.and_expr()?;
        while self.keyword("OR") {
            left = Expr::Or(Box::new(left), Box::new(self.and_expr()?));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> StoreResult<Expr> {
        let mut left = self.unary()?;
        while self.keyword("AND") {
            left = Expr::And(Box::new(left), Box::new(self.unary()?));
        }
        Ok(left)
    }

    fn unary(&mut self) -> StoreResult<Expr> {
        if self.keyword("NOT") {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.symbol("(") {
            let inner = self.or_expr()?;
            self.expect_symbol(")")?;
            return Ok(inner);
        }
        if self.keyword("CONTAINS") {
            self.expect_symbol("(")?;
            let haystack = self.operand()?;
            self.expect_symbol(",")?;
            let needle = self.operand()?;
            self.expect_symbol(")")?;
            return Ok(Expr::Contains(haystack, needle));
        }

        let left = self.operand()?;
        let comparison = match self.advance() {
            Some(Token::Symbol("=")) => Comparison::Eq,
            Some(Token::Symbol("!=")) => Comparison::Ne,
            Some(Token::Symbol("<")) => Comparison::Lt,
            Some(Token::Symbol("<=")) => Comparison::Le,
            Some(Token::Symbol(">")) => Comparison::Gt,
            Some(Token::Symbol(">=")) => Comparison::Ge,
            _ => return Err(bad_request("expected a comparison operator")),
        };
        let right = self.operand()?;
        Ok(Expr::Compare(left, comparison, right))
    }

    fn operand(&mut self) -> StoreResult<Operand> {
        match self.peek().cloned() {
            Some(Token::Param(name)) => {
                self.pos += 1;
                Ok(Operand::Literal(self.parameter(&name)?))
            },
            Some(Token::Number(number)) => {
                self.pos += 1;
                Ok(Operand::Literal(Value::from(number)))
            },
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => {
                self.pos += 1;
                Ok(Operand::Literal(Value::Bool(true)))
            },
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                self.pos += 1;
                Ok(Operand::Literal(Value::Bool(false)))
            },
            Some(Token::Ident(_)) => Ok(Operand::Field(self.field()?)),
            _ => Err(bad_request("expected an operand")),
        }
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

impl Operand {
    fn resolve<'v>(&'v self, document: &'v Value) -> Option<&'v Value> {
        match self {
            Operand::Field(name) => document.get(name),
            Operand::Literal(value) => Some(value),
        }
    }
}

impl Expr {
    fn matches(&self, document: &Value) -> bool {
        match self {
            Expr::Or(left, right) => left.matches(document) || right.matches(document),
            Expr::And(left, right) => left.matches(document) && right.matches(document),
            Expr::Not(inner) => !inner.matches(document),
            Expr::Contains(haystack, needle) => {
                match (haystack.resolve(document), needle.resolve(document)) {
                    (Some(Value::String(haystack)), Some(Value::String(needle))) => {
                        haystack.contains(needle.as_str())
                    },
                    _ => false,
                }
            },
            Expr::Compare(left, comparison, right) => {
                let ordering = match (left.resolve(document), right.resolve(document)) {
                    (Some(a), Some(b)) => compare_values(a, b),
                    _ => None,
                };
                match (ordering, comparison) {
                    (None, _) => false,
                    (Some(ordering), Comparison::Eq) => ordering == Ordering::Equal,
                    (Some(ordering), Comparison::Ne) => ordering != Ordering::Equal,
                    (Some(ordering), Comparison::Lt) => ordering == Ordering::Less,
                    (Some(ordering), Comparison::Le) => ordering != Ordering::Greater,
                    (Some(ordering), Comparison::Gt) => ordering == Ordering::Greater,
                    (Some(ordering), Comparison::Ge) => ordering != Ordering::Less,
                }
            },
        }
    }
}

impl Query {
    fn needs_merge(&self) -> bool {
        self.top.is_some() || self.order.is_some() || self.offset.is_some() || self.limit.is_some()
    }

    fn run(&self, documents: Vec<Value>) -> Vec<Value> {
        let mut rows: Vec<Value> = documents
            .into_iter()
            .filter(|document| {
                self.filter
                    .as_ref()
                    .map(|filter| filter.matches(document))
                    .unwrap_or(true)
            })
            .collect();

        if let Some((field, descending)) = &self.order {
            rows.sort_by(|a, b| {
                let ordering = match (a.get(field), b.get(field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => Ordering::Equal,
                };
                if *descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let rows = rows
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .take(self.top.unwrap_or(usize::MAX));

        match &self.projection {
            None => rows.collect(),
            Some(fields) => rows
                .map(|row| {
                    let projected: Map<String, Value> = fields
                        .iter()
                        .filter_map(|field| row.get(field).map(|v| (field.clone(), v.clone())))
                        .collect();
                    Value::Object(projected)
                })
                .collect(),
        }
    }
}

/// Connector handing out a shared store, counting calls.
///
/// Can fail its first calls and delay every call to widen race windows.
pub struct CountingConnector {
    store: Arc<dyn DocumentStore>,
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
    modes: Mutex<Vec<CredentialMode>>,
}

impl CountingConnector {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            delay: None,
            modes: Mutex::new(Vec::new()),
        }
    }

    /// Fail the first `count` connection attempts
    pub fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, AtomicOrdering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    /// Credential modes seen, one per call
    pub fn modes(&self) -> Vec<CredentialMode> {
        self.modes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl StoreConnector for CountingConnector {
    async fn connect(
        &self,
        _endpoint: &str,
        credential: Credential,
    ) -> StoreResult<Arc<dyn DocumentStore>> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        self.modes.lock().unwrap().push(credential.mode());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failed = self
            .failures_left
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if failed {
            return Err(StoreError::Transport("connection refused".to_string()));
        }

        Ok(self.store.clone())
    }
}

/// Token source returning a fixed token
pub struct StaticTokenSource {
    token: String,
    lifetime: ChronoDuration,
    calls: AtomicUsize,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            lifetime: ChronoDuration::hours(1),
            calls: AtomicUsize::new(0),
        }
    }

    /// Tokens expire this long after being issued
    pub fn with_lifetime(mut self, lifetime: ChronoDuration) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self, _scope: &str) -> StoreResult<AccessToken> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(AccessToken::new(self.token.clone(), Utc::now() + self.lifetime))
    }
}
