//! Lua script backend.
//!
//! Every call gets a fresh VM and re-reads the script file, so edits take
//! effect on the next call. The script may return a table of functions or
//! define them as globals.
//!
//! Object calls go to a function named after the method when the returned
//! table has one, else to `call`:
//!
//! ```lua
//! local M = {}
//! function M.on(object, method, params)
//!     return '{"on":true}'
//! end
//! function M.call(object, method, params)
//!     log.info("call " .. object .. "." .. method)
//!     return '{"ok":true}'
//! end
//! return M
//! ```

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, Lua, Value as LuaValue, Variadic, VmState};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};
use ubusconf::UbusdConfig;

use crate::error::ScriptError;

/// Callable used when the call does not name one.
pub const DEFAULT_CALLABLE: &str = "call";

/// Which function of the script a call runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Per-method function of the module table, else [`DEFAULT_CALLABLE`]
    Method(String),
    /// Exactly this function
    Named(String),
}

impl Target {
    fn label(&self) -> &str {
        match self {
            Target::Method(name) | Target::Named(name) => name,
        }
    }
}

/// Instructions between deadline checks inside the VM.
const DEADLINE_CHECK_EVERY: u32 = 10_000;

#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Serves ordinary object calls
    pub callback_script: PathBuf,
    /// Serves the self-describing bridge call
    pub rpc_script: PathBuf,
    pub timeout: Duration,
    /// Strip file, process and debug access from the VM
    pub sandbox: bool,
}

impl ScriptConfig {
    pub fn from_config(config: &UbusdConfig) -> Self {
        Self {
            callback_script: config.paths.callback_script.clone(),
            rpc_script: config.paths.rpc_script.clone(),
            timeout: Duration::from_millis(config.backend.script_timeout_ms),
            sandbox: config.backend.sandbox,
        }
    }
}

pub struct ScriptBackend {
    config: ScriptConfig,
}

impl ScriptBackend {
    pub fn new(config: ScriptConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScriptConfig {
        &self.config
    }

    /// Run the callback script's default callable with `(object, method, payload)`.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn call_object(
        &self,
        object: &str,
        method: &str,
        payload: &str,
    ) -> Result<String, ScriptError> {
        let args = vec![object.to_string(), method.to_string(), payload.to_string()];
        let target = Target::Method(method.to_string());
        self.run(self.config.callback_script.clone(), target, args)
            .await
    }

    /// Run `function` from the RPC script with the payload as its only argument.
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    pub async fn call_rpc(&self, function: &str, payload: &str) -> Result<String, ScriptError> {
        let target = Target::Named(function.to_string());
        self.run(self.config.rpc_script.clone(), target, vec![payload.to_string()])
            .await
    }

    async fn run(
        &self,
        path: PathBuf,
        target: Target,
        args: Vec<String>,
    ) -> Result<String, ScriptError> {
        let limit = self.config.timeout;
        let sandbox = self.config.sandbox;
        let name = target.label().to_string();

        // the VM hook enforces the same deadline inside the blocking thread
        let result = timeout(limit, async {
            tokio::task::spawn_blocking(move || run_blocking(&path, &target, args, limit, sandbox))
                .await
                .map_err(|e| ScriptError::CallFailed {
                    name: name.clone(),
                    message: format!("script task panicked: {}", e),
                })?
        })
        .await
        .unwrap_or_else(|_| {
            Err(ScriptError::CallFailed {
                name: name.clone(),
                message: format!("timed out after {:?}", limit),
            })
        });

        if let Err(ref e) = result {
            warn!("{}", e);
        }
        result
    }
}

fn run_blocking(
    path: &Path,
    target: &Target,
    args: Vec<String>,
    limit: Duration,
    sandbox: bool,
) -> Result<String, ScriptError> {
    let start = Instant::now();
    let label = path.display().to_string();

    let source = std::fs::read_to_string(path).map_err(|e| ScriptError::NotFound {
        path: label.clone(),
        message: e.to_string(),
    })?;

    let lua = create_lua(sandbox).map_err(|e| ScriptError::NotFound {
        path: label.clone(),
        message: format!("cannot prepare Lua state: {}", e),
    })?;

    let deadline = start + limit;
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(DEADLINE_CHECK_EVERY),
        move |_lua, _debug| {
            if Instant::now() > deadline {
                Err(mlua::Error::runtime("script deadline exceeded"))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    let module: LuaValue = lua
        .load(source.as_str())
        .set_name(label.as_str())
        .eval()
        .map_err(|e| ScriptError::NotFound {
            path: label.clone(),
            message: e.to_string(),
        })?;

    let function = target.label();
    let Some(callable) = resolve_callable(&lua, &module, target) else {
        return Err(ScriptError::Unsupported {
            path: label,
            name: function.to_string(),
        });
    };

    let result: LuaValue =
        callable
            .call(Variadic::from_iter(args))
            .map_err(|e| ScriptError::CallFailed {
                name: function.to_string(),
                message: e.to_string(),
            })?;

    debug!("{}:{} finished in {:?}", label, function, start.elapsed());

    match result {
        LuaValue::String(s) => Ok(s.to_string_lossy().to_string()),
        LuaValue::Integer(i) => Ok(i.to_string()),
        LuaValue::Number(n) => Ok(n.to_string()),
        _ => Err(ScriptError::NoResponse {
            name: function.to_string(),
        }),
    }
}

fn resolve_callable(lua: &Lua, module: &LuaValue, target: &Target) -> Option<Function> {
    let lookup = |name: &str| -> Option<Function> {
        let value: LuaValue = match module {
            LuaValue::Table(table) => table.get(name),
            _ => lua.globals().get(name),
        }
        .ok()?;
        match value {
            LuaValue::Function(f) => Some(f),
            _ => None,
        }
    };

    match target {
        Target::Named(name) => lookup(name),
        // per-method functions only from a module table, never from globals
        Target::Method(method) => match module {
            LuaValue::Table(_) => lookup(method),
            _ => None,
        }
        .or_else(|| lookup(DEFAULT_CALLABLE)),
    }
}

fn create_lua(sandbox: bool) -> mlua::Result<Lua> {
    let lua = Lua::new();
    register_stdlib(&lua)?;
    if sandbox {
        remove_dangerous_globals(&lua)?;
    }
    Ok(lua)
}

/// `log.info/warn/error/debug` for scripts.
fn register_stdlib(lua: &Lua) -> mlua::Result<()> {
    let log_table = lua.create_table()?;

    log_table.set(
        "info",
        lua.create_function(|_, msg: String| {
            tracing::info!(target: "ubusd.script", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "warn",
        lua.create_function(|_, msg: String| {
            tracing::warn!(target: "ubusd.script", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "error",
        lua.create_function(|_, msg: String| {
            tracing::error!(target: "ubusd.script", "{}", msg);
            Ok(())
        })?,
    )?;
    log_table.set(
        "debug",
        lua.create_function(|_, msg: String| {
            tracing::debug!(target: "ubusd.script", "{}", msg);
            Ok(())
        })?,
    )?;

    lua.globals().set("log", log_table)
}

fn remove_dangerous_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set("dofile", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;

    // Keep: os.clock, os.date, os.difftime, os.getenv, os.time
    let os_table: mlua::Table = globals.get("os")?;
    for name in [
        "execute",
        "exit",
        "remove",
        "rename",
        "setenv",
        "setlocale",
        "tmpname",
    ] {
        os_table.set(name, LuaValue::Nil)?;
    }

    globals.set("debug", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;

    Ok(())
}
