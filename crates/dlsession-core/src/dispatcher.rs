//! Command dispatcher - method name + argument map to a coordinator call
//!
//! The boundary speaks loosely typed JSON. Arguments are decoded into a
//! [`Command`] up front, so malformed input fails with `BadArguments` before
//! anything touches session state.

use crate::coordinator::Coordinator;
use crate::error::CoreError;
use dlsession_types::{Gid, OptionValue, Options};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A decoded boundary call
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Add { uri: String, options: Options },
    Pause { gid: Gid, force: bool },
    Resume { gid: Gid },
    Remove { gid: Gid, force: bool },
    Query { gid: Gid },
    List,
    GlobalStat,
    ActiveDownloads,
    Option { gid: Gid, name: String },
    Options { gid: Gid },
    PurgeResults,
    GlobalOption { name: String },
    GlobalOptions,
    ChangeGlobalOptions { options: Options },
}

impl Command {
    /// Decode `method` and its arguments. A `null` argument payload is
    /// treated as an empty map.
    pub fn decode(method: &str, args: &Value) -> Result<Self, CoreError> {
        let empty = Map::new();
        let args = match args {
            Value::Null => Args(&empty),
            Value::Object(map) => Args(map),
            _ => {
                return Err(CoreError::BadArguments(
                    "arguments must be an object".to_string(),
                ))
            }
        };

        let command = match method {
            "addDownload" => Command::Add {
                uri: args.uri()?,
                options: args.options()?,
            },
            "pauseDownload" => Command::Pause {
                gid: args.gid()?,
                force: args.flag("force")?,
            },
            "resumeDownload" => Command::Resume { gid: args.gid()? },
            "removeDownload" => Command::Remove {
                gid: args.gid()?,
                force: args.flag("force")?,
            },
            "queryDownload" => Command::Query { gid: args.gid()? },
            "listDownloads" => Command::List,
            "getGlobalStat" => Command::GlobalStat,
            "getActiveDownloads" => Command::ActiveDownloads,
            "getDownloadOption" => Command::Option {
                gid: args.gid()?,
                name: args.string("name")?,
            },
            "getDownloadOptions" => Command::Options { gid: args.gid()? },
            "purgeDownloadResults" => Command::PurgeResults,
            "getGlobalOption" => Command::GlobalOption {
                name: args.string("name")?,
            },
            "getGlobalOptions" => Command::GlobalOptions,
            "changeGlobalOption" => {
                if !args.0.contains_key("options") {
                    return Err(bad("missing 'options'".to_string()));
                }
                Command::ChangeGlobalOptions {
                    options: args.options()?,
                }
            }
            other => return Err(CoreError::NotImplemented(other.to_string())),
        };
        Ok(command)
    }

    /// Boundary method name of this command
    pub fn method(&self) -> &'static str {
        match self {
            Command::Add { .. } => "addDownload",
            Command::Pause { .. } => "pauseDownload",
            Command::Resume { .. } => "resumeDownload",
            Command::Remove { .. } => "removeDownload",
            Command::Query { .. } => "queryDownload",
            Command::List => "listDownloads",
            Command::GlobalStat => "getGlobalStat",
            Command::ActiveDownloads => "getActiveDownloads",
            Command::Option { .. } => "getDownloadOption",
            Command::Options { .. } => "getDownloadOptions",
            Command::PurgeResults => "purgeDownloadResults",
            Command::GlobalOption { .. } => "getGlobalOption",
            Command::GlobalOptions => "getGlobalOptions",
            Command::ChangeGlobalOptions { .. } => "changeGlobalOption",
        }
    }
}

/// Typed accessors over a JSON argument map
struct Args<'a>(&'a Map<String, Value>);

impl Args<'_> {
    fn string(&self, key: &str) -> Result<String, CoreError> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::String(_)) => Err(bad(format!("'{}' must not be empty", key))),
            Some(_) => Err(bad(format!("'{}' must be a string", key))),
            None => Err(bad(format!("missing '{}'", key))),
        }
    }

    fn gid(&self) -> Result<Gid, CoreError> {
        self.string("gid").map(Gid::from)
    }

    fn uri(&self) -> Result<String, CoreError> {
        let uri = self.string("uri")?;
        url::Url::parse(&uri).map_err(|e| bad(format!("invalid uri '{}': {}", uri, e)))?;
        Ok(uri)
    }

    fn flag(&self, key: &str) -> Result<bool, CoreError> {
        match self.0.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(bad(format!("'{}' must be a boolean", key))),
        }
    }

    fn options(&self) -> Result<Options, CoreError> {
        let map = match self.0.get("options") {
            None | Some(Value::Null) => return Ok(Options::new()),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(bad("'options' must be an object".to_string())),
        };

        map.iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::Bool(b) => OptionValue::Bool(*b),
                    Value::String(s) => OptionValue::Str(s.clone()),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => OptionValue::Int(i),
                        None => OptionValue::Float(n.as_f64().unwrap_or(f64::NAN)),
                    },
                    _ => return Err(bad(format!("option '{}' must be a scalar", key))),
                };
                Ok((key.clone(), value))
            })
            .collect()
    }
}

fn bad(message: String) -> CoreError {
    CoreError::BadArguments(message)
}

fn to_value(value: impl Serialize) -> Result<Value, CoreError> {
    Ok(serde_json::to_value(value)?)
}

/// Routes boundary calls to the coordinator
pub struct CommandDispatcher {
    coordinator: Arc<Coordinator>,
    command_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(coordinator: Arc<Coordinator>, command_timeout: Duration) -> Self {
        Self {
            coordinator,
            command_timeout,
        }
    }

    /// Decode and run one boundary call, bounded by the command timeout
    pub async fn dispatch(&self, method: &str, args: &Value) -> Result<Value, CoreError> {
        let command = Command::decode(method, args)?;
        debug!(method, "Dispatching command");

        let operation = command.method();
        match tokio::time::timeout(self.command_timeout, self.execute(command)).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout {
                operation,
                after: self.command_timeout,
            }),
        }
    }

    /// Run an already decoded command
    pub async fn execute(&self, command: Command) -> Result<Value, CoreError> {
        let coordinator = &self.coordinator;
        match command {
            Command::Add { uri, options } => to_value(coordinator.add(&uri, options).await?),
            Command::Pause { gid, force } => {
                coordinator.pause(&gid, force).await?;
                Ok(Value::Null)
            }
            Command::Resume { gid } => {
                coordinator.resume(&gid).await?;
                Ok(Value::Null)
            }
            Command::Remove { gid, force } => {
                coordinator.remove(&gid, force).await?;
                Ok(Value::Null)
            }
            Command::Query { gid } => to_value(coordinator.query(&gid)?),
            Command::List => to_value(coordinator.list()),
            Command::GlobalStat => to_value(coordinator.global_stat()),
            Command::ActiveDownloads => to_value(coordinator.active_gids()),
            Command::Option { gid, name } => to_value(coordinator.option(&gid, &name)?),
            Command::Options { gid } => to_value(coordinator.options(&gid)?),
            Command::PurgeResults => to_value(coordinator.purge()),
            Command::GlobalOption { name } => to_value(coordinator.global_option(&name)),
            Command::GlobalOptions => to_value(coordinator.global_options()),
            Command::ChangeGlobalOptions { options } => {
                coordinator.change_global_options(options);
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::CoreConfig;
    use crate::engine::mock::MockEngine;
    use crate::registry::SessionRegistry;
    use dlsession_types::ErrorCode;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio_util::sync::CancellationToken;

    fn dispatcher_with(engine: Arc<MockEngine>, config: CoreConfig) -> CommandDispatcher {
        let bus = EventBus::new(CancellationToken::new()).unwrap();
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(SessionRegistry::new()),
            bus,
            engine,
            &config,
        ));
        CommandDispatcher::new(coordinator, config.command_timeout())
    }

    fn dispatcher() -> (CommandDispatcher, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::default());
        (dispatcher_with(engine.clone(), CoreConfig::default()), engine)
    }

    async fn code_of(dispatcher: &CommandDispatcher, method: &str, args: Value) -> ErrorCode {
        dispatcher.dispatch(method, &args).await.unwrap_err().code()
    }

    #[tokio::test]
    async fn test_full_lifecycle_through_dispatch() {
        let (dispatcher, _engine) = dispatcher();

        let gid = dispatcher
            .dispatch("addDownload", &json!({"uri": "http://x/file"}))
            .await
            .unwrap();
        let gid = gid.as_str().unwrap().to_string();

        let session = dispatcher
            .dispatch("queryDownload", &json!({ "gid": gid }))
            .await
            .unwrap();
        assert_eq!(session["state"], "Active");
        assert_eq!(session["progress"]["total"], -1);

        dispatcher
            .coordinator
            .on_progress(&Gid::from(gid.as_str()), 50, Some(100));
        let session = dispatcher
            .dispatch("queryDownload", &json!({ "gid": gid }))
            .await
            .unwrap();
        assert_eq!(session["progress"], json!({"downloaded": 50, "total": 100}));

        dispatcher
            .coordinator
            .on_progress(&Gid::from(gid.as_str()), 100, Some(100));
        let session = dispatcher
            .dispatch("queryDownload", &json!({ "gid": gid }))
            .await
            .unwrap();
        assert_eq!(session["state"], "Complete");

        let removed = dispatcher
            .dispatch("removeDownload", &json!({ "gid": gid }))
            .await
            .unwrap();
        assert_eq!(removed, Value::Null);
        assert_eq!(
            code_of(&dispatcher, "queryDownload", json!({ "gid": gid })).await,
            ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_unknown_gid_is_not_found() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(
            code_of(&dispatcher, "pauseDownload", json!({"gid": "unknown-gid"})).await,
            ErrorCode::NotFound
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_implemented() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(
            code_of(&dispatcher, "frobnicate", Value::Null).await,
            ErrorCode::NotImplemented
        );
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_bad_args() {
        let (dispatcher, engine) = dispatcher();
        for (method, args) in [
            ("addDownload", json!({})),
            ("addDownload", json!({"uri": 42})),
            ("addDownload", json!({"uri": "not a uri"})),
            ("addDownload", json!({"uri": "http://x/a", "options": {"header": ["a"]}})),
            ("pauseDownload", json!({"gid": ""})),
            ("pauseDownload", json!({"gid": "abc", "force": "yes"})),
            ("getDownloadOption", json!({"gid": "abc"})),
            ("listDownloads", json!([1, 2])),
            ("getGlobalOption", json!({})),
            ("changeGlobalOption", json!({})),
            ("changeGlobalOption", json!({"options": {"dir": null}})),
        ] {
            assert_eq!(
                code_of(&dispatcher, method, args).await,
                ErrorCode::BadArgs,
                "{}",
                method
            );
        }
        // Rejected before reaching the engine
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_illegal_transition_code() {
        let (dispatcher, _) = dispatcher();
        let gid = dispatcher
            .dispatch("addDownload", &json!({"uri": "http://x/file"}))
            .await
            .unwrap();
        let error = dispatcher
            .dispatch("resumeDownload", &json!({ "gid": gid }))
            .await
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::IllegalState);
        assert!(error.payload().message.contains("Active"));
    }

    #[tokio::test]
    async fn test_engine_unsupported_is_native_error() {
        let (dispatcher, engine) = dispatcher();
        engine.unsupported_resume.store(true, Ordering::Release);
        let gid = dispatcher
            .dispatch("addDownload", &json!({"uri": "http://x/file"}))
            .await
            .unwrap();
        dispatcher
            .dispatch("pauseDownload", &json!({ "gid": gid, "force": true }))
            .await
            .unwrap();

        assert_eq!(
            code_of(&dispatcher, "resumeDownload", json!({ "gid": gid })).await,
            ErrorCode::NativeError
        );
    }

    #[tokio::test]
    async fn test_command_timeout_is_native_error() {
        let engine = Arc::new(MockEngine::default());
        engine.start_delay_ms.store(500, Ordering::Release);
        let dispatcher = dispatcher_with(
            engine,
            CoreConfig {
                command_timeout_ms: 20,
                ..CoreConfig::default()
            },
        );

        let error = dispatcher
            .dispatch("addDownload", &json!({"uri": "http://x/slow"}))
            .await
            .unwrap_err();
        assert!(matches!(error, CoreError::Timeout { operation: "addDownload", .. }));
        assert_eq!(error.code(), ErrorCode::NativeError);
    }

    #[tokio::test]
    async fn test_options_and_stats() {
        let (dispatcher, _) = dispatcher();
        let gid = dispatcher
            .dispatch(
                "addDownload",
                &json!({"uri": "magnet:?xt=urn:btih:abc", "options": {"split": 4, "dir": "/tmp", "ratio": 1.5, "seed": false}}),
            )
            .await
            .unwrap();

        let split = dispatcher
            .dispatch("getDownloadOption", &json!({"gid": gid, "name": "split"}))
            .await
            .unwrap();
        assert_eq!(split, json!(4));
        let missing = dispatcher
            .dispatch("getDownloadOption", &json!({"gid": gid, "name": "out"}))
            .await
            .unwrap();
        assert_eq!(missing, Value::Null);

        let options = dispatcher
            .dispatch("getDownloadOptions", &json!({ "gid": gid }))
            .await
            .unwrap();
        assert_eq!(options, json!({"dir": "/tmp", "ratio": 1.5, "seed": false, "split": 4}));

        let stat = dispatcher.dispatch("getGlobalStat", &Value::Null).await.unwrap();
        assert_eq!(stat, json!({"numActive": 1, "numWaiting": 0, "numStopped": 0}));

        let active = dispatcher
            .dispatch("getActiveDownloads", &Value::Null)
            .await
            .unwrap();
        assert_eq!(active, json!([gid]));
    }

    #[tokio::test]
    async fn test_global_options_round_trip() {
        let (dispatcher, _) = dispatcher();
        let changed = dispatcher
            .dispatch(
                "changeGlobalOption",
                &json!({"options": {"max-connection-per-server": 8, "dir": "/data"}}),
            )
            .await
            .unwrap();
        assert_eq!(changed, Value::Null);

        let dir = dispatcher
            .dispatch("getGlobalOption", &json!({"name": "dir"}))
            .await
            .unwrap();
        assert_eq!(dir, json!("/data"));
        let unset = dispatcher
            .dispatch("getGlobalOption", &json!({"name": "split"}))
            .await
            .unwrap();
        assert_eq!(unset, Value::Null);
        let all = dispatcher
            .dispatch("getGlobalOptions", &Value::Null)
            .await
            .unwrap();
        assert_eq!(all, json!({"dir": "/data", "max-connection-per-server": 8}));

        // New downloads inherit them, their own options win
        let gid = dispatcher
            .dispatch(
                "addDownload",
                &json!({"uri": "http://x/a", "options": {"dir": "/tmp"}}),
            )
            .await
            .unwrap();
        let options = dispatcher
            .dispatch("getDownloadOptions", &json!({ "gid": gid }))
            .await
            .unwrap();
        assert_eq!(options, json!({"dir": "/tmp", "max-connection-per-server": 8}));
    }

    #[tokio::test]
    async fn test_purge_counts_removed_results() {
        let (dispatcher, engine) = dispatcher();
        dispatcher
            .dispatch("addDownload", &json!({"uri": "http://x/a"}))
            .await
            .unwrap();
        engine.fail_start.store(true, Ordering::Release);
        dispatcher
            .dispatch("addDownload", &json!({"uri": "http://x/b"}))
            .await
            .unwrap();

        let purged = dispatcher
            .dispatch("purgeDownloadResults", &Value::Null)
            .await
            .unwrap();
        assert_eq!(purged, json!(1));

        let listed = dispatcher.dispatch("listDownloads", &json!({})).await.unwrap();
        assert_eq!(listed.as_array().map(Vec::len), Some(1));
    }
}
