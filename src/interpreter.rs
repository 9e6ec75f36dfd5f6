//! Interactive console interpreter
//!
//! A stateful read-eval loop for console-style plugins: lines accumulate
//! into a pending statement while a block or an explicit continuation is
//! open, then evaluate as an expression first and as a statement
//! sequence second. Output produced during one evaluation is redirected
//! to host-registered sinks for the duration of that call only.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use mlua::{Function, Lua, MultiValue, RegistryKey, Table, Value, Variadic};
use tracing::debug;

use crate::failure;
use crate::host::Sink;

/// Chunk name for console input; deliberately not an internal bridge
/// chunk, since console tracebacks are plugin-relevant.
const CONSOLE_CHUNK: &str = "=console";

/// Trailing tokens that open a block and switch the console into
/// accumulation mode until the two-blank-line terminator.
static BLOCK_OPENERS: &[&str] = &["do", "then", "else", "function", "repeat"];

/// Result of feeding one line to the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// The pending statement was evaluated
    Complete { success: bool },
    /// Inside an open block or continuation; nothing evaluated yet
    AwaitingMore,
}

/// One completion candidate: full replacement text plus the bare
/// matched symbol for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub inserted: String,
    pub display: String,
}

type SinkCell = Arc<Mutex<Option<Sink>>>;

/// Binds the console output sink for the duration of one evaluation and
/// restores the previous binding on every exit path.
struct SinkScope {
    cell: SinkCell,
    previous: Option<Sink>,
}

impl SinkScope {
    fn bind(cell: &SinkCell, sink: Sink) -> Self {
        let previous = {
            let mut active = match cell.lock() {
                Ok(active) => active,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *active, Some(sink))
        };
        Self {
            cell: Arc::clone(cell),
            previous,
        }
    }
}

impl Drop for SinkScope {
    fn drop(&mut self) {
        let mut active = match self.cell.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active = self.previous.take();
    }
}

/// Compiled form of the pending text
enum Prepared<'lua> {
    Expression(Function<'lua>),
    Statements(Function<'lua>),
    Invalid(String),
}

pub struct Interpreter {
    pending: String,
    in_block: bool,
    in_continuation: bool,
    original_ns: RegistryKey,
    ns: RegistryKey,
    completion_index: Vec<String>,
    out_sink: Sink,
    err_sink: Sink,
    active_out: SinkCell,
    exit_requested: Arc<AtomicBool>,
}

impl Interpreter {
    pub fn new(lua: &Lua, out: Sink, err: Sink) -> mlua::Result<Self> {
        let original_ns = lua.create_registry_value(lua.create_table()?)?;
        let ns = lua.create_registry_value(lua.create_table()?)?;

        let mut interpreter = Self {
            pending: String::new(),
            in_block: false,
            in_continuation: false,
            original_ns,
            ns,
            completion_index: Vec::new(),
            out_sink: out,
            err_sink: err,
            active_out: Arc::new(Mutex::new(None)),
            exit_requested: Arc::new(AtomicBool::new(false)),
        };
        interpreter.reset(lua)?;
        Ok(interpreter)
    }

    /// Prompt for the next line
    #[must_use]
    pub fn prompt(&self) -> &'static str {
        if self.in_block || self.in_continuation {
            "... "
        } else {
            ">>> "
        }
    }

    /// Feed one line; evaluates once the pending statement is complete
    pub fn execute(&mut self, lua: &Lua, line: &str) -> mlua::Result<Execution> {
        self.pending.push_str(line);
        self.pending.push('\n');

        let trimmed = self.pending.trim_end();
        if (self.in_block || ends_in_block_opener(trimmed))
            && !self.pending.ends_with("\n\n\n")
        {
            self.in_block = true;
            return Ok(Execution::AwaitingMore);
        }
        if line.ends_with('\\') {
            // Drop the marker; the newline already separates the lines.
            self.pending.truncate(self.pending.len() - 2);
            self.pending.push('\n');
            self.in_continuation = true;
            return Ok(Execution::AwaitingMore);
        }

        let source = std::mem::take(&mut self.pending);
        self.in_block = false;
        self.in_continuation = false;

        let ns: Table = lua.registry_value(&self.ns)?;
        let prepared = prepare(lua, &ns, &source)?;

        // A construct the token scan missed can still be syntactically
        // open; keep accumulating unless the blank-line terminator has
        // already forced this evaluation.
        if let Prepared::Invalid(message) = &prepared {
            if message.contains("<eof>") && !source.ends_with("\n\n\n") {
                self.pending = source;
                self.in_block = true;
                return Ok(Execution::AwaitingMore);
            }
        }

        let _scope = SinkScope::bind(&self.active_out, Arc::clone(&self.out_sink));

        let success = match prepared {
            Prepared::Expression(chunk) => self.run(lua, &ns, chunk, true)?,
            Prepared::Statements(chunk) => self.run(lua, &ns, chunk, false)?,
            Prepared::Invalid(message) => {
                self.write_error(&message);
                false
            }
        };

        Ok(Execution::Complete { success })
    }

    fn run(
        &mut self,
        lua: &Lua,
        ns: &Table,
        chunk: Function,
        display: bool,
    ) -> mlua::Result<bool> {
        match chunk.call::<_, MultiValue>(()) {
            Ok(values) => {
                if self.exit_requested.load(Ordering::SeqCst) {
                    self.reset(lua)?;
                    return Ok(true);
                }
                if display {
                    let value = values.into_iter().next().unwrap_or(Value::Nil);
                    if value != Value::Nil {
                        self.display(lua, ns, value)?;
                    }
                }
                Ok(true)
            }
            Err(err) => {
                if self.exit_requested.load(Ordering::SeqCst) {
                    // Explicit interpreter-exit request: reset, never
                    // terminate the process.
                    self.reset(lua)?;
                    return Ok(true);
                }
                // Exactly one write per failed evaluation.
                self.write_error(&failure::brief_message(&err));
                Ok(false)
            }
        }
    }

    /// Display hook: render the value, bind it as the last result
    fn display(&self, lua: &Lua, ns: &Table, value: Value) -> mlua::Result<()> {
        let tostring: Function = lua.globals().get("tostring")?;
        let rendered: String = tostring.call(value.clone())?;
        ns.set("_", value)?;
        (self.out_sink)(&format!("{rendered}\n"));
        Ok(())
    }

    fn write_error(&self, message: &str) {
        (self.err_sink)(&format!("{message}\n"));
    }

    /// Discard pending state and rebuild the namespace from the
    /// original; completion index failures degrade to no suggestions
    pub fn reset(&mut self, lua: &Lua) -> mlua::Result<()> {
        self.pending.clear();
        self.in_block = false;
        self.in_continuation = false;
        self.exit_requested.store(false, Ordering::SeqCst);

        let original: Table = lua.registry_value(&self.original_ns)?;
        let fresh = lua.create_table()?;
        for pair in original.clone().pairs::<Value, Value>() {
            let (key, value) = pair?;
            fresh.set(key, value)?;
        }

        let meta = lua.create_table()?;
        meta.set("__index", lua.globals())?;
        fresh.set_metatable(Some(meta));

        self.bind_builtins(lua, &fresh)?;

        if std::env::var_os("CRUCIBLE_DEBUG").is_some() {
            // Self-reference for poking at the console from inside it.
            fresh.set("console", fresh.clone())?;
        }

        self.ns = lua.create_registry_value(fresh)?;
        self.rebuild_completion_index(lua);
        debug!("console namespace reset");
        Ok(())
    }

    fn bind_builtins(&self, lua: &Lua, ns: &Table) -> mlua::Result<()> {
        let cell = Arc::clone(&self.active_out);
        let print = lua.create_function(move |lua, args: Variadic<Value>| {
            let tostring: Function = lua.globals().get("tostring")?;
            let mut rendered = Vec::with_capacity(args.len());
            for value in args.iter() {
                rendered.push(tostring.call::<_, String>(value.clone())?);
            }
            let line = format!("{}\n", rendered.join("\t"));

            let active = {
                let active = match cell.lock() {
                    Ok(active) => active,
                    Err(poisoned) => poisoned.into_inner(),
                };
                active.clone()
            };
            match active {
                Some(sink) => sink(&line),
                None => print!("{line}"),
            }
            Ok(())
        })?;
        ns.set("print", print)?;

        let flag = Arc::clone(&self.exit_requested);
        let exit = lua.create_function(move |_, ()| -> mlua::Result<()> {
            flag.store(true, Ordering::SeqCst);
            // Abort the rest of the chunk; execute() turns this into a
            // reset instead of an error report.
            Err(mlua::Error::RuntimeError("console exit".to_string()))
        })?;
        ns.set("exit", exit)?;

        Ok(())
    }

    fn rebuild_completion_index(&mut self, lua: &Lua) {
        self.completion_index = completion_symbols(lua, &self.ns).unwrap_or_default();
    }

    /// Complete the trailing partial word of `text`; never raises.
    ///
    /// Dotted paths resolve through namespace tables: `foo.ba` lists the
    /// keys of `foo` starting with `ba`, keeping the `foo.` prefix in
    /// the inserted text.
    #[must_use]
    pub fn complete(&self, lua: &Lua, text: &str) -> Vec<Completion> {
        self.try_complete(lua, text).unwrap_or_default()
    }

    fn try_complete(&self, lua: &Lua, text: &str) -> mlua::Result<Vec<Completion>> {
        let word_start = text
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        let prefix = &text[..word_start];
        let word = &text[word_start..];
        if word.is_empty() {
            return Ok(Vec::new());
        }

        if let Some(dot) = word.rfind('.') {
            let head = &word[..dot];
            let partial = &word[dot + 1..];

            let ns: Table = lua.registry_value(&self.ns)?;
            let mut value = Value::Table(ns);
            for segment in head.split('.') {
                let Value::Table(table) = value else {
                    return Ok(Vec::new());
                };
                value = table.get(segment)?;
            }
            let Value::Table(target) = value else {
                return Ok(Vec::new());
            };

            let mut keys = Vec::new();
            for pair in target.pairs::<Value, Value>() {
                let (key, _) = pair?;
                if let Value::String(s) = key {
                    let key = s.to_str()?.to_string();
                    if key.starts_with(partial) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();

            Ok(keys
                .into_iter()
                .map(|key| Completion {
                    inserted: format!("{prefix}{head}.{key}"),
                    display: key,
                })
                .collect())
        } else {
            Ok(self
                .completion_index
                .iter()
                .filter(|symbol| symbol.starts_with(word))
                .map(|symbol| Completion {
                    inserted: format!("{prefix}{symbol}"),
                    display: symbol.clone(),
                })
                .collect())
        }
    }

    /// The original namespace the host registered
    pub fn namespace<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        lua.registry_value(&self.original_ns)
    }

    /// The live namespace evaluations run in
    pub fn working_namespace<'lua>(&self, lua: &'lua Lua) -> mlua::Result<Table<'lua>> {
        lua.registry_value(&self.ns)
    }

    /// Replace the original namespace and reset onto a fresh copy of it
    pub fn set_namespace(&mut self, lua: &Lua, namespace: Option<Table>) -> mlua::Result<()> {
        let original = match namespace {
            Some(table) => table,
            None => lua.create_table()?,
        };
        self.original_ns = lua.create_registry_value(original)?;
        self.reset(lua)
    }
}

fn ends_in_block_opener(trimmed: &str) -> bool {
    if trimmed.ends_with('{') || trimmed.ends_with('(') {
        return true;
    }
    let last_word = trimmed
        .rsplit(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("");
    BLOCK_OPENERS.contains(&last_word)
}

/// Compile pending text, expression first, statements second
fn prepare<'lua>(lua: &'lua Lua, ns: &Table<'lua>, source: &str) -> mlua::Result<Prepared<'lua>> {
    let loader: Function = lua.globals().get("load")?;

    let expression = format!("return {source}");
    let (chunk, _message): (Option<Function>, Option<String>) =
        loader.call((expression, CONSOLE_CHUNK, "t", ns.clone()))?;
    if let Some(chunk) = chunk {
        return Ok(Prepared::Expression(chunk));
    }

    let (chunk, message): (Option<Function>, Option<String>) =
        loader.call((source.to_string(), CONSOLE_CHUNK, "t", ns.clone()))?;
    match chunk {
        Some(chunk) => Ok(Prepared::Statements(chunk)),
        None => Ok(Prepared::Invalid(
            message.unwrap_or_else(|| "invalid console input".to_string()),
        )),
    }
}

fn completion_symbols(lua: &Lua, ns: &RegistryKey) -> mlua::Result<Vec<String>> {
    let mut symbols = Vec::new();

    let table: Table = lua.registry_value(ns)?;
    for pair in table.pairs::<Value, Value>() {
        let (key, _) = pair?;
        if let Value::String(s) = key {
            symbols.push(s.to_str()?.to_string());
        }
    }
    for pair in lua.globals().pairs::<Value, Value>() {
        let (key, _) = pair?;
        if let Value::String(s) = key {
            symbols.push(s.to_str()?.to_string());
        }
    }

    symbols.sort();
    symbols.dedup();
    Ok(symbols)
}
