//! Host configuration mirroring.
//!
//! The host owns the option store; this layer applies typed patches
//! through its parser and keeps a cached snapshot that is re-fetched when
//! the host's version counter advances.

use alloc::format;
use alloc::string::String;

/// Trace-level failures tolerated before generation is switched off.
pub const MAX_FAILURES: u32 = 2;

/// The host side of the option store.
pub trait OptionsHost {
    /// Monotonic counter bumped on every option change.
    fn options_version(&self) -> u32;
    /// Full snapshot as a JSON object keyed by host option names.
    fn options_json(&self) -> String;
    /// Feeds one `--name` / `--no-name` / `--name=value` argument to the
    /// host's option parser.
    fn parse_option(&mut self, arg: &str);
}

/// A recognised configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKey {
    EnableTraces,
    EnableInterpEntry,
    EnableJitCall,
    EnableBackwardBranches,
    EnableCallResume,
    EnableWasmEh,
    DisableHeuristic,
    EnableStats,
    EstimateHeat,
    CountBailouts,
    DumpTraces,
    UseConstants,
    NoExitBackwardBranches,
    DirectJitCalls,
    EliminateNullChecks,
    MinimumTraceLength,
    MinimumTraceHitCount,
    JitCallHitCount,
    JitCallFlushThreshold,
    InterpEntryHitCount,
    InterpEntryFlushThreshold,
    WasmBytesLimit,
}

impl OptionKey {
    pub const ALL: [OptionKey; 22] = [
        OptionKey::EnableTraces,
        OptionKey::EnableInterpEntry,
        OptionKey::EnableJitCall,
        OptionKey::EnableBackwardBranches,
        OptionKey::EnableCallResume,
        OptionKey::EnableWasmEh,
        OptionKey::DisableHeuristic,
        OptionKey::EnableStats,
        OptionKey::EstimateHeat,
        OptionKey::CountBailouts,
        OptionKey::DumpTraces,
        OptionKey::UseConstants,
        OptionKey::NoExitBackwardBranches,
        OptionKey::DirectJitCalls,
        OptionKey::EliminateNullChecks,
        OptionKey::MinimumTraceLength,
        OptionKey::MinimumTraceHitCount,
        OptionKey::JitCallHitCount,
        OptionKey::JitCallFlushThreshold,
        OptionKey::InterpEntryHitCount,
        OptionKey::InterpEntryFlushThreshold,
        OptionKey::WasmBytesLimit,
    ];

    /// The camelCase name used by embedder configuration.
    pub fn key_name(self) -> &'static str {
        match self {
            OptionKey::EnableTraces => "enableTraces",
            OptionKey::EnableInterpEntry => "enableInterpEntry",
            OptionKey::EnableJitCall => "enableJitCall",
            OptionKey::EnableBackwardBranches => "enableBackwardBranches",
            OptionKey::EnableCallResume => "enableCallResume",
            OptionKey::EnableWasmEh => "enableWasmEh",
            OptionKey::DisableHeuristic => "disableHeuristic",
            OptionKey::EnableStats => "enableStats",
            OptionKey::EstimateHeat => "estimateHeat",
            OptionKey::CountBailouts => "countBailouts",
            OptionKey::DumpTraces => "dumpTraces",
            OptionKey::UseConstants => "useConstants",
            OptionKey::NoExitBackwardBranches => "noExitBackwardBranches",
            OptionKey::DirectJitCalls => "directJitCalls",
            OptionKey::EliminateNullChecks => "eliminateNullChecks",
            OptionKey::MinimumTraceLength => "minimumTraceLength",
            OptionKey::MinimumTraceHitCount => "minimumTraceHitCount",
            OptionKey::JitCallHitCount => "jitCallHitCount",
            OptionKey::JitCallFlushThreshold => "jitCallFlushThreshold",
            OptionKey::InterpEntryHitCount => "interpEntryHitCount",
            OptionKey::InterpEntryFlushThreshold => "interpEntryFlushThreshold",
            OptionKey::WasmBytesLimit => "wasmBytesLimit",
        }
    }

    /// The kebab-case name the host's option parser understands. This
    /// mapping is shared with the host and must not drift.
    pub fn host_name(self) -> &'static str {
        match self {
            OptionKey::EnableTraces => "jiterpreter-traces-enabled",
            OptionKey::EnableInterpEntry => "jiterpreter-interp-entry-enabled",
            OptionKey::EnableJitCall => "jiterpreter-jit-call-enabled",
            OptionKey::EnableBackwardBranches => "jiterpreter-backward-branches-enabled",
            OptionKey::EnableCallResume => "jiterpreter-call-resume-enabled",
            OptionKey::EnableWasmEh => "jiterpreter-wasm-eh-enabled",
            OptionKey::DisableHeuristic => "jiterpreter-disable-heuristic",
            OptionKey::EnableStats => "jiterpreter-stats-enabled",
            OptionKey::EstimateHeat => "jiterpreter-estimate-heat",
            OptionKey::CountBailouts => "jiterpreter-count-bailouts",
            OptionKey::DumpTraces => "jiterpreter-dump-traces",
            OptionKey::UseConstants => "jiterpreter-use-constants",
            OptionKey::NoExitBackwardBranches => "jiterpreter-no-exit-backward-branches",
            OptionKey::DirectJitCalls => "jiterpreter-direct-jit-calls",
            OptionKey::EliminateNullChecks => "jiterpreter-eliminate-null-checks",
            OptionKey::MinimumTraceLength => "jiterpreter-minimum-trace-length",
            OptionKey::MinimumTraceHitCount => "jiterpreter-minimum-trace-hit-count",
            OptionKey::JitCallHitCount => "jiterpreter-jit-call-hit-count",
            OptionKey::JitCallFlushThreshold => "jiterpreter-jit-call-flush-threshold",
            OptionKey::InterpEntryHitCount => "jiterpreter-interp-entry-hit-count",
            OptionKey::InterpEntryFlushThreshold => "jiterpreter-interp-entry-flush-threshold",
            OptionKey::WasmBytesLimit => "jiterpreter-wasm-bytes-limit",
        }
    }

    pub fn from_key_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.key_name() == name)
    }

    pub fn from_host_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.host_name() == name)
    }
}

/// A configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
}

impl OptionValue {
    fn from_json(value: &serde_json::Value) -> Option<Self> {
        if let Some(flag) = value.as_bool() {
            return Some(OptionValue::Bool(flag));
        }
        value.as_i64().map(OptionValue::Int)
    }
}

/// The mirrored option table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JiterpOptions {
    pub enable_traces: bool,
    pub enable_interp_entry: bool,
    pub enable_jit_call: bool,
    pub enable_backward_branches: bool,
    pub enable_call_resume: bool,
    pub enable_wasm_eh: bool,
    pub disable_heuristic: bool,
    pub enable_stats: bool,
    pub estimate_heat: bool,
    pub count_bailouts: bool,
    pub dump_traces: bool,
    pub use_constants: bool,
    pub no_exit_backward_branches: bool,
    pub direct_jit_calls: bool,
    pub eliminate_null_checks: bool,
    pub minimum_trace_length: i64,
    pub minimum_trace_hit_count: i64,
    pub jit_call_hit_count: i64,
    pub jit_call_flush_threshold: i64,
    pub interp_entry_hit_count: i64,
    pub interp_entry_flush_threshold: i64,
    pub wasm_bytes_limit: i64,
}

impl Default for JiterpOptions {
    fn default() -> Self {
        Self {
            enable_traces: true,
            enable_interp_entry: true,
            enable_jit_call: true,
            enable_backward_branches: true,
            enable_call_resume: false,
            enable_wasm_eh: false,
            disable_heuristic: false,
            enable_stats: false,
            estimate_heat: false,
            count_bailouts: false,
            dump_traces: false,
            use_constants: true,
            no_exit_backward_branches: false,
            direct_jit_calls: true,
            eliminate_null_checks: true,
            minimum_trace_length: 8,
            minimum_trace_hit_count: 5000,
            jit_call_hit_count: 3000,
            jit_call_flush_threshold: 128,
            interp_entry_hit_count: 1000,
            interp_entry_flush_threshold: 96,
            wasm_bytes_limit: 4 * 1024 * 1024,
        }
    }
}

impl JiterpOptions {
    /// Stores one value into its field; a value of the wrong kind is
    /// rejected with a warning.
    pub fn apply(&mut self, key: OptionKey, value: OptionValue) {
        use OptionKey::*;
        use OptionValue::*;
        match (key, value) {
            (EnableTraces, Bool(v)) => self.enable_traces = v,
            (EnableInterpEntry, Bool(v)) => self.enable_interp_entry = v,
            (EnableJitCall, Bool(v)) => self.enable_jit_call = v,
            (EnableBackwardBranches, Bool(v)) => self.enable_backward_branches = v,
            (EnableCallResume, Bool(v)) => self.enable_call_resume = v,
            (EnableWasmEh, Bool(v)) => self.enable_wasm_eh = v,
            (DisableHeuristic, Bool(v)) => self.disable_heuristic = v,
            (EnableStats, Bool(v)) => self.enable_stats = v,
            (EstimateHeat, Bool(v)) => self.estimate_heat = v,
            (CountBailouts, Bool(v)) => self.count_bailouts = v,
            (DumpTraces, Bool(v)) => self.dump_traces = v,
            (UseConstants, Bool(v)) => self.use_constants = v,
            (NoExitBackwardBranches, Bool(v)) => self.no_exit_backward_branches = v,
            (DirectJitCalls, Bool(v)) => self.direct_jit_calls = v,
            (EliminateNullChecks, Bool(v)) => self.eliminate_null_checks = v,
            (MinimumTraceLength, Int(v)) => self.minimum_trace_length = v,
            (MinimumTraceHitCount, Int(v)) => self.minimum_trace_hit_count = v,
            (JitCallHitCount, Int(v)) => self.jit_call_hit_count = v,
            (JitCallFlushThreshold, Int(v)) => self.jit_call_flush_threshold = v,
            (InterpEntryHitCount, Int(v)) => self.interp_entry_hit_count = v,
            (InterpEntryFlushThreshold, Int(v)) => self.interp_entry_flush_threshold = v,
            (WasmBytesLimit, Int(v)) => self.wasm_bytes_limit = v,
            (key, value) => {
                tracing::warn!("option `{}` rejected value {value:?}", key.key_name());
            }
        }
    }
}

/// Applies a typed option patch through the host's parser.
pub fn apply_options(host: &mut dyn OptionsHost, patch: &[(OptionKey, OptionValue)]) {
    for (key, value) in patch {
        let name = key.host_name();
        let arg = match value {
            OptionValue::Bool(true) => format!("--{name}"),
            OptionValue::Bool(false) => format!("--no-{name}"),
            OptionValue::Int(v) => format!("--{name}={v}"),
        };
        host.parse_option(&arg);
    }
}

/// String-keyed variant for embedder configuration. Unrecognised keys warn
/// and are skipped.
pub fn apply_named_options<'a>(
    host: &mut dyn OptionsHost,
    patch: impl IntoIterator<Item = (&'a str, OptionValue)>,
) {
    for (name, value) in patch {
        match OptionKey::from_key_name(name) {
            Some(key) => apply_options(host, &[(key, value)]),
            None => tracing::warn!("unknown option key `{name}`"),
        }
    }
}

/// A versioned snapshot of the host's option table.
#[derive(Debug, Default)]
pub struct OptionsCache {
    version: Option<u32>,
    table: JiterpOptions,
}

impl OptionsCache {
    /// The current option table, re-fetched from the host when its version
    /// counter has advanced. The returned table is read-only; updates go
    /// through [`apply_options`].
    pub fn get(&mut self, host: &dyn OptionsHost) -> &JiterpOptions {
        let version = host.options_version();
        if self.version != Some(version) {
            self.refresh(&host.options_json());
            self.version = Some(version);
        }
        &self.table
    }

    fn refresh(&mut self, json: &str) {
        match serde_json::from_str::<serde_json::Value>(json) {
            Ok(serde_json::Value::Object(entries)) => {
                for (name, value) in &entries {
                    let Some(key) = OptionKey::from_host_name(name) else {
                        tracing::warn!("unknown option `{name}` in host snapshot");
                        continue;
                    };
                    let Some(value) = OptionValue::from_json(value) else {
                        tracing::warn!("option `{name}` has a non-scalar value");
                        continue;
                    };
                    self.table.apply(key, value);
                }
            }
            Ok(_) => tracing::warn!("host options snapshot is not an object"),
            Err(error) => tracing::warn!("failed to parse host options snapshot: {error}"),
        }
    }
}

/// Counts trace-level compilation failures and, at [`MAX_FAILURES`],
/// switches every emission category off.
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: u32,
}

impl FailureTracker {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self, host: &mut dyn OptionsHost) {
        self.failures += 1;
        tracing::error!("trace compilation failure #{}", self.failures);
        if self.failures == MAX_FAILURES {
            tracing::error!("disabling jit generation after {MAX_FAILURES} failures");
            apply_options(
                host,
                &[
                    (OptionKey::EnableTraces, OptionValue::Bool(false)),
                    (OptionKey::EnableInterpEntry, OptionValue::Bool(false)),
                    (OptionKey::EnableJitCall, OptionValue::Bool(false)),
                ],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory host double that applies parsed arguments back to a JSON
    /// table, the way the real option store does.
    #[derive(Default)]
    struct MemoryHost {
        version: u32,
        table: serde_json::Map<String, serde_json::Value>,
        args: Vec<String>,
    }

    impl OptionsHost for MemoryHost {
        fn options_version(&self) -> u32 {
            self.version
        }

        fn options_json(&self) -> String {
            serde_json::Value::Object(self.table.clone()).to_string()
        }

        fn parse_option(&mut self, arg: &str) {
            self.args.push(arg.to_string());
            let arg = arg.trim_start_matches("--");
            let (name, value) = if let Some((name, value)) = arg.split_once('=') {
                (name, serde_json::json!(value.parse::<i64>().unwrap()))
            } else if let Some(name) = arg.strip_prefix("no-") {
                (name, serde_json::json!(false))
            } else {
                (arg, serde_json::json!(true))
            };
            self.table.insert(name.to_string(), value);
            self.version += 1;
        }
    }

    #[test]
    fn name_mapping_is_bijective() {
        for key in OptionKey::ALL {
            assert_eq!(OptionKey::from_key_name(key.key_name()), Some(key));
            assert_eq!(OptionKey::from_host_name(key.host_name()), Some(key));
        }
        assert_eq!(
            OptionKey::EnableTraces.host_name(),
            "jiterpreter-traces-enabled"
        );
        assert_eq!(OptionKey::from_key_name("bogus"), None);
    }

    #[test]
    fn patches_become_parser_arguments() {
        let mut host = MemoryHost::default();
        apply_options(
            &mut host,
            &[
                (OptionKey::EnableTraces, OptionValue::Bool(true)),
                (OptionKey::DumpTraces, OptionValue::Bool(false)),
                (OptionKey::MinimumTraceLength, OptionValue::Int(12)),
            ],
        );
        assert_eq!(
            host.args,
            [
                "--jiterpreter-traces-enabled",
                "--no-jiterpreter-dump-traces",
                "--jiterpreter-minimum-trace-length=12",
            ]
        );
    }

    #[test]
    fn unknown_string_keys_are_skipped() {
        let mut host = MemoryHost::default();
        apply_named_options(
            &mut host,
            [
                ("enableStats", OptionValue::Bool(true)),
                ("notAnOption", OptionValue::Bool(true)),
            ],
        );
        assert_eq!(host.args, ["--jiterpreter-stats-enabled"]);
    }

    #[test]
    fn cache_refreshes_only_when_the_version_advances() {
        let mut host = MemoryHost::default();
        let mut cache = OptionsCache::default();
        assert!(cache.get(&host).enable_traces);

        host.parse_option("--no-jiterpreter-traces-enabled");
        host.parse_option("--jiterpreter-wasm-bytes-limit=1024");
        let options = cache.get(&host);
        assert!(!options.enable_traces);
        assert_eq!(options.wasm_bytes_limit, 1024);

        // Mutating the table without bumping the version is not observed.
        host.table
            .insert("jiterpreter-traces-enabled".to_string(), serde_json::json!(true));
        assert!(!cache.get(&host).enable_traces);
    }

    #[test]
    fn unknown_snapshot_keys_are_ignored() {
        let mut host = MemoryHost::default();
        host.table
            .insert("not-a-jiterpreter-option".to_string(), serde_json::json!(1));
        host.version = 7;
        let mut cache = OptionsCache::default();
        assert_eq!(*cache.get(&host), JiterpOptions::default());
    }

    #[test]
    fn failure_tracker_disables_generation_at_the_limit() {
        let mut host = MemoryHost::default();
        let mut tracker = FailureTracker::default();
        tracker.record_failure(&mut host);
        assert!(host.args.is_empty());

        tracker.record_failure(&mut host);
        assert_eq!(
            host.args,
            [
                "--no-jiterpreter-traces-enabled",
                "--no-jiterpreter-interp-entry-enabled",
                "--no-jiterpreter-jit-call-enabled",
            ]
        );
        let mut cache = OptionsCache::default();
        let options = cache.get(&host);
        assert!(!options.enable_traces);
        assert!(!options.enable_interp_entry);
        assert!(!options.enable_jit_call);
    }
}
