use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const SCRIPT_VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_PYTHON_VERSION: &str = "3.12";
const STATE_FILE_VERSION: u32 = 1;
const ACTIVATED_ROOT_ENV: &str = "PRIMER_ACTIVATED_ROOT";
const ACTIVATED_VERSION_ENV: &str = "PRIMER_ACTIVATED_VERSION";
const LOG_ENV: &str = "PRIMER_LOG";
const RULE: &str = "-----------------------------------------------------------------------";

#[cfg(windows)]
const SCRIPT_EXTENSION: &str = ".cmd";
#[cfg(not(windows))]
const SCRIPT_EXTENSION: &str = ".sh";

#[derive(Parser, Debug)]
#[command(name = "primer", version, about = "Development environment bootstrapper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap the current directory as an activatable development environment.
    Bootstrap(BootstrapArgs),
    /// Driven by a generated Activate script; not intended for direct use.
    #[command(hide = true)]
    Activate(TransitionArgs),
    /// Driven by a generated Deactivate script; not intended for direct use.
    #[command(hide = true)]
    Deactivate(TransitionArgs),
}

#[derive(Args, Debug)]
struct BootstrapArgs {
    /// Python version to provision; the published default is used when omitted.
    #[arg(long)]
    python_version: Option<String>,
    /// Branch of the bootstrap distribution that produced this environment.
    #[arg(long)]
    bootstrap_branch: Option<String>,
    /// Suffix appended to generated script, hook, and virtual environment names.
    #[arg(long, default_value = "")]
    suffix: String,
    /// Arguments forwarded to the BootstrapEpilog hooks.
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Args, Debug)]
struct TransitionArgs {
    #[arg(long)]
    root: PathBuf,
    #[arg(long)]
    python_version: String,
    #[arg(long, default_value = "")]
    suffix: String,
    #[arg(long, value_enum, default_value = "direct")]
    invocation: Invocation,
    #[arg(long, hide = true)]
    shell_commands: Option<PathBuf>,
    /// Arguments forwarded to the epilog hooks.
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Invocation {
    Direct,
    Sourced,
}

#[derive(Debug, Error)]
enum PrimerError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("ERROR: {0}")]
    State(String),
    #[error("ERROR: {filename} failed.")]
    HookFailed { filename: String, code: i32 },
    #[error("ERROR: Executing the {filename} output failed.")]
    SideEffectFailed { filename: String, code: i32 },
    #[error("{}", sourcing_instructions(.script))]
    NotSourced { script: String },
}

impl PrimerError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::HookFailed { code, .. } | Self::SideEffectFailed { code, .. } => *code,
            _ => 1,
        }
    }
}

fn sourcing_instructions(script: &str) -> String {
    [
        format!("ERROR: {script} must be sourced so that it can modify the environment of the"),
        "calling shell. Run one of the following commands instead:".to_string(),
        String::new(),
        format!("    source ./{script}"),
        format!("    . ./{script}"),
    ]
    .join("\n")
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvironmentState {
    version: u32,
    #[serde(default)]
    configurations: BTreeMap<String, ConfigurationRecord>,
}

impl EnvironmentState {
    fn empty() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            configurations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigurationRecord {
    suffix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bootstrap_branch: Option<String>,
    bootstrapped_at: DateTime<Utc>,
}

/// The record a successful activation leaves in the calling shell.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ActivationRecord {
    root: String,
    version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleEvent {
    Bootstrap,
    Activate,
    Deactivate,
}

impl LifecycleEvent {
    fn name(self) -> &'static str {
        match self {
            Self::Bootstrap => "Bootstrap",
            Self::Activate => "Activate",
            Self::Deactivate => "Deactivate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransitionKind {
    Activate,
    Deactivate,
}

impl TransitionKind {
    fn event(self) -> LifecycleEvent {
        match self {
            Self::Activate => LifecycleEvent::Activate,
            Self::Deactivate => LifecycleEvent::Deactivate,
        }
    }

    fn subcommand(self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
        }
    }

    fn script_name(self, suffix: &str) -> String {
        format!("{}{}{}", self.event().name(), suffix, SCRIPT_EXTENSION)
    }

    fn past_tense(self) -> &'static str {
        match self {
            Self::Activate => "activated",
            Self::Deactivate => "deactivated",
        }
    }
}

enum StepOutcome {
    Done,
    AlreadyExists,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Bootstrap(args) => handle_bootstrap(args),
        Commands::Activate(args) => handle_transition(TransitionKind::Activate, args),
        Commands::Deactivate(args) => handle_transition(TransitionKind::Deactivate, args),
    };

    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(err.exit_code());
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

// ----------------------------------------------------------------------
// Bootstrap

fn handle_bootstrap(args: BootstrapArgs) -> Result<(), PrimerError> {
    let root = fs::canonicalize(env::current_dir()?)?;
    let home = required_home_dir()?;
    tracing::debug!(root = %root.display(), "bootstrap start");

    run_step("Downloading Bootstrap code", || Ok(StepOutcome::Done))?;
    println!();
    println!("Script Version {SCRIPT_VERSION}");
    println!();

    let version = match &args.python_version {
        Some(version) => version.clone(),
        None => {
            run_step("Downloading default python version information", || {
                Ok(StepOutcome::Done)
            })?;
            DEFAULT_PYTHON_VERSION.to_string()
        }
    };

    run_step("Validating python version", || {
        validate_python_version(&version)?;
        Ok(StepOutcome::Done)
    })?;
    println!();
    println!("Python Version {version}");
    println!();

    let manager_dir = home.join(".primer").join("runtime-manager");
    run_step("Downloading the runtime manager", || {
        ensure_dir_step(&manager_dir)
    })?;

    let runtime_env_dir = home.join(".primer").join("envs").join(&version);
    run_step("Initializing the runtime environment", || {
        ensure_dir_step(&runtime_env_dir)
    })?;

    run_step("Activating the runtime environment", || Ok(StepOutcome::Done))?;

    let venv_dir = root.join(format!(".venv{}", args.suffix));
    run_step("Creating the python virtual environment", || {
        create_venv_step(&venv_dir, &version)
    })?;
    println!();

    let hooks = run_hooks(
        LifecycleEvent::Bootstrap,
        &args.suffix,
        &root,
        &args.args,
        SideEffectMode::Execute,
    )?;
    if hooks.ran {
        println!();
    }

    let mut state = read_state(&root)?;
    state.configurations.insert(
        version.clone(),
        ConfigurationRecord {
            suffix: args.suffix.clone(),
            bootstrap_branch: args.bootstrap_branch.clone(),
            bootstrapped_at: Utc::now(),
        },
    );
    write_state(&root, &state)?;

    let exe = env::current_exe()?;
    for kind in [TransitionKind::Activate, TransitionKind::Deactivate] {
        let script_name = kind.script_name(&args.suffix);
        let body = transition_script(kind, &root, &version, &args.suffix, &exe);
        write_atomic_text_file(&root.join(&script_name), &body, Some(0o755))?;
        println!("Creating {script_name}...DONE.");
    }

    print_bootstrap_banner(&root, &args.suffix);
    Ok(())
}

fn run_step<F>(label: &str, step: F) -> Result<(), PrimerError>
where
    F: FnOnce() -> Result<StepOutcome, PrimerError>,
{
    // A plain progress line followed by a cursor-up escape so the final
    // DONE form overwrites it on a terminal.
    println!("{label}...");
    io::stdout().flush()?;
    match step()? {
        StepOutcome::Done => println!("\x1b[1A{label}...DONE."),
        StepOutcome::AlreadyExists => println!("\x1b[1A{label}...DONE (already exists)."),
    }
    Ok(())
}

fn ensure_dir_step(path: &Path) -> Result<StepOutcome, PrimerError> {
    if path.is_dir() {
        return Ok(StepOutcome::AlreadyExists);
    }
    fs::create_dir_all(path)?;
    Ok(StepOutcome::Done)
}

fn create_venv_step(path: &Path, version: &str) -> Result<StepOutcome, PrimerError> {
    fs::create_dir_all(path)?;
    fs::write(path.join("pyvenv.cfg"), format!("version = {version}\n"))?;
    Ok(StepOutcome::Done)
}

fn validate_python_version(token: &str) -> Result<(), PrimerError> {
    let parts: Vec<&str> = token.split('.').collect();
    let well_formed = (2..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    if well_formed {
        Ok(())
    } else {
        Err(PrimerError::State(format!(
            "\"{token}\" is not a valid python version."
        )))
    }
}

fn print_bootstrap_banner(root: &Path, suffix: &str) {
    let activate = root.join(format!("Activate{suffix}{SCRIPT_EXTENSION}"));
    let deactivate = root.join(format!("Deactivate{suffix}{SCRIPT_EXTENSION}"));
    println!();
    println!();
    println!();
    println!("{RULE}");
    println!("{RULE}");
    println!();
    println!("This environment has been successfully bootstrapped. Run the following");
    println!("commands to activate and deactivate the development environment:");
    println!();
    println!(
        "  Activate{suffix}{SCRIPT_EXTENSION}:    {}",
        activate.display()
    );
    println!(
        "  Deactivate{suffix}{SCRIPT_EXTENSION}:  {}",
        deactivate.display()
    );
    println!();
    println!("{RULE}");
    println!("{RULE}");
    println!();
    println!();
    println!();
}

// ----------------------------------------------------------------------
// Activate / Deactivate

fn handle_transition(kind: TransitionKind, args: TransitionArgs) -> Result<(), PrimerError> {
    let script = kind.script_name(&args.suffix);
    if args.invocation != Invocation::Sourced {
        return Err(PrimerError::NotSourced { script });
    }

    let root_text = args.root.to_string_lossy().to_string();
    let record = read_activation_record();
    tracing::debug!(
        kind = kind.subcommand(),
        root = %root_text,
        version = %args.python_version,
        activated = record.is_some(),
        "transition requested"
    );

    match kind {
        TransitionKind::Activate => {
            check_activate(record.as_ref(), &root_text, &args.python_version)?;
            let state = read_state(&args.root)?;
            if !state.configurations.contains_key(&args.python_version) {
                return Err(PrimerError::State(format!(
                    "This environment has not been bootstrapped with \"{}\".",
                    args.python_version
                )));
            }
        }
        TransitionKind::Deactivate => {
            check_deactivate(record.as_ref(), &root_text, &args.python_version)?;
        }
    }

    // With a shell-commands channel, hook side effects and the closing
    // message are handed to the calling shell so the side-effect commands
    // run in its context; without one everything happens here.
    let side_effects = match &args.shell_commands {
        Some(_) => SideEffectMode::Defer,
        None => SideEffectMode::Execute,
    };
    let outcome = run_hooks(kind.event(), &args.suffix, &args.root, &args.args, side_effects)?;

    match &args.shell_commands {
        Some(path) => {
            let commands = transition_commands(
                kind,
                &root_text,
                &args.python_version,
                outcome.deferred.as_ref(),
            );
            fs::write(path, commands)?;
        }
        None => {
            println!();
            println!("{root_text} has been {}.", kind.past_tense());
            println!();
        }
    }
    Ok(())
}

fn read_activation_record() -> Option<ActivationRecord> {
    let root = env::var(ACTIVATED_ROOT_ENV).ok()?;
    let version = env::var(ACTIVATED_VERSION_ENV).unwrap_or_default();
    Some(ActivationRecord { root, version })
}

fn check_activate(
    record: Option<&ActivationRecord>,
    root: &str,
    version: &str,
) -> Result<(), PrimerError> {
    match record {
        None => Ok(()),
        // Root mismatch takes precedence over version mismatch; failures
        // always report the token of the live activation, not the request.
        Some(active) if active.root != root => Err(PrimerError::State(format!(
            "This environment cannot be activated over \"{}\".",
            active.root
        ))),
        Some(active) if active.version != version => Err(PrimerError::State(format!(
            "This environment cannot be activated over \"{}\".",
            active.version
        ))),
        Some(_) => Ok(()),
    }
}

fn check_deactivate(
    record: Option<&ActivationRecord>,
    root: &str,
    version: &str,
) -> Result<(), PrimerError> {
    match record {
        None => Err(PrimerError::State(
            "The environment has not been activated.".to_string(),
        )),
        Some(active) if active.root != root => Err(PrimerError::State(format!(
            "This environment was activated by \"{}\".",
            active.root
        ))),
        Some(active) if active.version != version => Err(PrimerError::State(format!(
            "This environment was activated with \"{}\".",
            active.version
        ))),
        Some(_) => Ok(()),
    }
}

/// Builds the program the generated script sources into the calling shell on
/// success: any deferred hook side effects first, then the activation record
/// update and the closing message. A failing side effect returns its exit
/// code before the record is touched, so a rejected transition leaves the
/// shell exactly as it was.
#[cfg(not(windows))]
fn transition_commands(
    kind: TransitionKind,
    root: &str,
    version: &str,
    deferred: Option<&DeferredSideEffect>,
) -> String {
    let mut out = String::new();
    if let Some(side) = deferred {
        let path = shell_quote(&side.path.to_string_lossy());
        let error = shell_quote(&format!(
            "ERROR: Executing the {} output failed.",
            side.filename
        ));
        out.push_str(&format!(
            ". {path}\n\
             _primer_epilog_result=$?\n\
             rm -f {path}\n\
             if [[ ${{_primer_epilog_result}} -ne 0 ]]; then\n\
             \x20\x20\x20\x20echo {error} >&2\n\
             \x20\x20\x20\x20return ${{_primer_epilog_result}}\n\
             fi\n\
             unset _primer_epilog_result\n"
        ));
    }
    match kind {
        TransitionKind::Activate => out.push_str(&activation_commands(root, version)),
        TransitionKind::Deactivate => out.push_str(&deactivation_commands()),
    }
    out.push_str(&format!(
        "echo ''\necho {}\necho ''\n",
        shell_quote(&format!("{root} has been {}.", kind.past_tense()))
    ));
    out
}

#[cfg(windows)]
fn transition_commands(
    kind: TransitionKind,
    root: &str,
    version: &str,
    deferred: Option<&DeferredSideEffect>,
) -> String {
    let mut out = String::new();
    if let Some(side) = deferred {
        out.push_str(&format!(
            "call \"{path}\"\r\n\
             set _PRIMER_EPILOG_RESULT=%ERRORLEVEL%\r\n\
             del /q \"{path}\" 2>nul\r\n\
             if %_PRIMER_EPILOG_RESULT% NEQ 0 (\r\n\
             \x20\x20\x20\x20echo ERROR: Executing the {filename} output failed.\r\n\
             \x20\x20\x20\x20exit /b %_PRIMER_EPILOG_RESULT%\r\n\
             )\r\n\
             set \"_PRIMER_EPILOG_RESULT=\"\r\n",
            path = side.path.display(),
            filename = side.filename,
        ));
    }
    match kind {
        TransitionKind::Activate => out.push_str(&activation_commands(root, version)),
        TransitionKind::Deactivate => out.push_str(&deactivation_commands()),
    }
    out.push_str(&format!(
        "echo.\r\necho {root} has been {}.\r\necho.\r\n",
        kind.past_tense()
    ));
    out
}

#[cfg(not(windows))]
fn activation_commands(root: &str, version: &str) -> String {
    format!(
        "export {ACTIVATED_ROOT_ENV}={}\nexport {ACTIVATED_VERSION_ENV}={}\n",
        shell_quote(root),
        shell_quote(version)
    )
}

#[cfg(windows)]
fn activation_commands(root: &str, version: &str) -> String {
    format!("set \"{ACTIVATED_ROOT_ENV}={root}\"\nset \"{ACTIVATED_VERSION_ENV}={version}\"\n")
}

#[cfg(not(windows))]
fn deactivation_commands() -> String {
    format!("unset {ACTIVATED_ROOT_ENV}\nunset {ACTIVATED_VERSION_ENV}\n")
}

#[cfg(windows)]
fn deactivation_commands() -> String {
    format!("set \"{ACTIVATED_ROOT_ENV}=\"\nset \"{ACTIVATED_VERSION_ENV}=\"\n")
}

// ----------------------------------------------------------------------
// Hooks

fn native_hook_name(event: LifecycleEvent, suffix: &str) -> String {
    format!("{}Epilog{}{}", event.name(), suffix, SCRIPT_EXTENSION)
}

fn python_hook_name(event: LifecycleEvent, suffix: &str) -> String {
    format!("{}Epilog{}.py", event.name(), suffix)
}

/// How a python hook's non-empty command file is honored.
enum SideEffectMode {
    /// Execute the commands in a child of this process. Used by bootstrap,
    /// which has no calling shell to hand them to.
    Execute,
    /// Persist the command file and hand it back to the caller, which
    /// forwards it to the calling shell. Used by sourced transitions.
    Defer,
}

struct HookOutcome {
    ran: bool,
    deferred: Option<DeferredSideEffect>,
}

struct DeferredSideEffect {
    filename: String,
    path: PathBuf,
}

/// Runs the optional epilog hooks for one lifecycle event: the native hook
/// first, then the python hook with its command file. The first failure
/// aborts the whole transition.
fn run_hooks(
    event: LifecycleEvent,
    suffix: &str,
    root: &Path,
    args: &[String],
    side_effects: SideEffectMode,
) -> Result<HookOutcome, PrimerError> {
    let mut ran = false;
    let mut deferred = None;

    let native_name = native_hook_name(event, suffix);
    let native_path = root.join(&native_name);
    if native_path.is_file() && is_executable(&native_path) {
        ran = true;
        tracing::debug!(hook = %native_name, "running native hook");
        let status = run_script_file(&native_path, args, root)?;
        if !status.success() {
            return Err(PrimerError::HookFailed {
                filename: native_name,
                code: exit_code_of(status),
            });
        }
    }

    let python_name = python_hook_name(event, suffix);
    let python_path = root.join(&python_name);
    if python_path.is_file() {
        ran = true;
        tracing::debug!(hook = %python_name, "running python hook");
        let interpreter = python_interpreter()?;
        let commands_file = tempfile::Builder::new()
            .prefix("primer-epilog-")
            .suffix(SCRIPT_EXTENSION)
            .tempfile()?;
        let status = Command::new(&interpreter)
            .arg(&python_path)
            .arg(commands_file.path())
            .args(args)
            .current_dir(root)
            .status()?;
        if !status.success() {
            return Err(PrimerError::HookFailed {
                filename: python_name,
                code: exit_code_of(status),
            });
        }
        let commands = fs::read_to_string(commands_file.path())?;
        if !commands.trim().is_empty() {
            match side_effects {
                SideEffectMode::Execute => {
                    let status = run_script_file(commands_file.path(), &[], root)?;
                    if !status.success() {
                        return Err(PrimerError::SideEffectFailed {
                            filename: python_name,
                            code: exit_code_of(status),
                        });
                    }
                }
                SideEffectMode::Defer => {
                    let (_, path) = commands_file
                        .keep()
                        .map_err(|err| PrimerError::Io(err.error))?;
                    deferred = Some(DeferredSideEffect {
                        filename: python_name,
                        path,
                    });
                }
            }
        }
    }

    Ok(HookOutcome { ran, deferred })
}

fn python_interpreter() -> Result<PathBuf, PrimerError> {
    which::which("python3")
        .or_else(|_| which::which("python"))
        .map_err(|_| PrimerError::Process("python interpreter not found on PATH".to_string()))
}

#[cfg(unix)]
fn run_script_file(path: &Path, args: &[String], cwd: &Path) -> Result<ExitStatus, PrimerError> {
    let status = Command::new("/bin/bash")
        .arg(path)
        .args(args)
        .current_dir(cwd)
        .status()?;
    Ok(status)
}

#[cfg(not(unix))]
fn run_script_file(path: &Path, args: &[String], cwd: &Path) -> Result<ExitStatus, PrimerError> {
    let status = Command::new("cmd")
        .arg("/C")
        .arg(path)
        .args(args)
        .current_dir(cwd)
        .status()?;
    Ok(status)
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ----------------------------------------------------------------------
// Generated scripts

#[cfg(not(windows))]
fn transition_script(
    kind: TransitionKind,
    root: &Path,
    version: &str,
    suffix: &str,
    exe: &Path,
) -> String {
    let exe = shell_quote(&exe.to_string_lossy());
    let root = shell_quote(&root.to_string_lossy());
    let version_q = shell_quote(version);
    let suffix_q = shell_quote(suffix);
    let subcommand = kind.subcommand();
    format!(
        r#"#!/usr/bin/env bash
# Generated by primer {SCRIPT_VERSION}. Rerun bootstrap to regenerate.

if [[ "${{BASH_SOURCE[0]}}" == "${{0}}" ]]; then
    {exe} {subcommand} --root {root} --python-version {version_q} --suffix {suffix_q} --invocation direct
    exit 1
fi

_primer_commands="$(mktemp)"

{exe} {subcommand} --root {root} --python-version {version_q} --suffix {suffix_q} --invocation sourced --shell-commands "${{_primer_commands}}" -- "$@"
_primer_result=$?

if [[ ${{_primer_result}} -eq 0 && -s "${{_primer_commands}}" ]]; then
    . "${{_primer_commands}}"
    _primer_result=$?
fi

rm -f "${{_primer_commands}}"
unset _primer_commands _primer_epilog_result

return ${{_primer_result}}
"#
    )
}

#[cfg(windows)]
fn transition_script(
    kind: TransitionKind,
    root: &Path,
    version: &str,
    suffix: &str,
    exe: &Path,
) -> String {
    let subcommand = kind.subcommand();
    format!(
        "@echo off\r\n\
         REM Generated by primer {SCRIPT_VERSION}. Rerun bootstrap to regenerate.\r\n\
         \r\n\
         set \"_PRIMER_COMMANDS=%TEMP%\\primer_%RANDOM%%RANDOM%.cmd\"\r\n\
         \"{exe}\" {subcommand} --root \"{root}\" --python-version \"{version}\" --suffix \"{suffix}\" --invocation sourced --shell-commands \"%_PRIMER_COMMANDS%\" -- %*\r\n\
         set _PRIMER_RESULT=%ERRORLEVEL%\r\n\
         if %_PRIMER_RESULT% EQU 0 if exist \"%_PRIMER_COMMANDS%\" call \"%_PRIMER_COMMANDS%\"\r\n\
         if %_PRIMER_RESULT% EQU 0 set _PRIMER_RESULT=%ERRORLEVEL%\r\n\
         del /q \"%_PRIMER_COMMANDS%\" 2>nul\r\n\
         set \"_PRIMER_COMMANDS=\"\r\n\
         exit /b %_PRIMER_RESULT%\r\n",
        exe = exe.display(),
        root = root.display(),
    )
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

// ----------------------------------------------------------------------
// Environment state file

fn state_path(root: &Path) -> PathBuf {
    root.join(".primer").join("environment.yaml")
}

fn read_state(root: &Path) -> Result<EnvironmentState, PrimerError> {
    let path = state_path(root);
    if !path.exists() {
        return Ok(EnvironmentState::empty());
    }
    let content = fs::read_to_string(&path)?;
    let state: EnvironmentState = serde_yaml::from_str(&content)?;
    if state.version != STATE_FILE_VERSION {
        return Err(PrimerError::Config(format!(
            "unsupported environment state version {}",
            state.version
        )));
    }
    Ok(state)
}

fn write_state(root: &Path, state: &EnvironmentState) -> Result<(), PrimerError> {
    write_atomic_text_file(&state_path(root), &serde_yaml::to_string(state)?, None)
}

// ----------------------------------------------------------------------
// Filesystem helpers

fn required_home_dir() -> Result<PathBuf, PrimerError> {
    home_dir()
        .ok_or_else(|| PrimerError::Config("unable to determine the home directory".to_string()))
}

fn ensure_parent(path: &Path) -> Result<(), PrimerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<(), PrimerError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "primer".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
