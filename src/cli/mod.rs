//! KL-020: CLI subcommands (init, validate, services, compile, commands).

use crate::cache::ArtifactCache;
use crate::core::container::Lookup;
use crate::core::kernel::{Compiled, Kernel};
use crate::core::loader;
use crate::core::registry::{Definition, Registry};
use crate::extensions;
use clap::Subcommand;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a starter kiln.yaml
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate an application file without building any service
    Validate {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,
    },

    /// List assembled service definitions
    Services {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// Only services carrying this tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile the assembled graph to Rust source
    Compile {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,

        /// Store the artifact (and its manifest) here instead of printing it
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Rewrite the artifact even if it is fresh
        #[arg(long, requires = "cache_dir")]
        force: bool,
    },

    /// List console command services in registration order
    Commands {
        /// Path to kiln.yaml
        #[arg(short, long, default_value = "kiln.yaml")]
        file: PathBuf,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Services { file, tag, json } => cmd_services(&file, tag.as_deref(), json),
        Commands::Compile {
            file,
            cache_dir,
            force,
        } => cmd_compile(&file, cache_dir.as_deref(), force),
        Commands::Commands { file } => cmd_commands(&file),
    }
}

const STARTER: &str = r#"parameters:
  app:
    name: my-app

includes: []

services:
  greeter:
    create: Greeter
    arguments: ["%app.name%"]
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join("kiln.yaml");
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }
    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&config_path, STARTER)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;
    println!("Initialized kiln project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

/// Kernel over `file` with the built-in extensions its sections need.
/// Application callables are unknown here, so none are registered and
/// compilation does not check them.
fn kernel_for(file: &Path) -> Result<Kernel, String> {
    let config = loader::load_config(file).map_err(|e| e.to_string())?;
    let exts = extensions::for_sections(config.sections.keys().map(String::as_str));
    Ok(Kernel::new()
        .config(config)
        .extensions(exts)
        .catalog(extensions::catalog()))
}

fn assemble(file: &Path) -> Result<Registry, String> {
    kernel_for(file)?.assemble().map_err(|e| e.to_string())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = loader::load_config(file).map_err(|e| e.to_string())?;
    let errors = loader::validate_config(&config, extensions::BUILTIN);
    if !errors.is_empty() {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        return Err(format!("{} validation error(s)", errors.len()));
    }

    let registry = assemble(file)?;
    println!(
        "OK: {} ({} services, {} files)",
        file.display(),
        registry.len(),
        config.sources.len()
    );
    Ok(())
}

fn describe(definition: &Definition) -> String {
    let mut flags = vec![if definition.shared { "shared" } else { "factory" }];
    if !definition.public {
        flags.push("private");
    }
    let mut line = format!("{} [{}]", definition.id, flags.join(", "));
    if !definition.types.is_empty() {
        let types: Vec<&str> = definition.types.iter().map(String::as_str).collect();
        line.push_str(&format!(" types: {}", types.join(", ")));
    }
    if !definition.tags.is_empty() {
        let tags: Vec<&str> = definition.tags.keys().map(String::as_str).collect();
        line.push_str(&format!(" tags: {}", tags.join(", ")));
    }
    if let Some(origin) = &definition.origin {
        line.push_str(&format!(" (from {})", origin));
    }
    line
}

fn to_json(definition: &Definition) -> serde_json::Value {
    let tags: serde_json::Map<String, serde_json::Value> = definition
        .tags
        .iter()
        .map(|(name, attrs)| {
            (
                name.clone(),
                serde_json::to_value(attrs).unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    serde_json::json!({
        "id": definition.id,
        "shared": definition.shared,
        "public": definition.public,
        "types": definition.types,
        "tags": tags,
        "origin": definition.origin,
    })
}

fn cmd_services(file: &Path, tag: Option<&str>, json: bool) -> Result<(), String> {
    let registry = assemble(file)?;
    let selected: Vec<&Definition> = registry
        .definitions()
        .filter(|d| tag.is_none_or(|t| d.tags.contains_key(t)))
        .collect();

    if json {
        let list: Vec<serde_json::Value> = selected.iter().map(|d| to_json(d)).collect();
        let out = serde_json::to_string_pretty(&list).map_err(|e| format!("JSON error: {}", e))?;
        println!("{}", out);
        return Ok(());
    }
    for definition in &selected {
        println!("{}", describe(definition));
    }
    println!();
    println!("{} of {} services", selected.len(), registry.len());
    Ok(())
}

fn cmd_compile(file: &Path, cache_dir: Option<&Path>, force: bool) -> Result<(), String> {
    let kernel = kernel_for(file)?;
    let Some(dir) = cache_dir else {
        let source = kernel.compile().map_err(|e| e.to_string())?;
        print!("{}", source);
        return Ok(());
    };

    let cache = ArtifactCache::new(dir);
    let compiled = if force {
        kernel.recompile(&cache)
    } else {
        kernel.compile_cached(&cache)
    }
    .map_err(|e| e.to_string())?;
    match compiled {
        Compiled::Reused(path) => println!("Fresh: {}", path.display()),
        Compiled::Written(path) => println!("Compiled: {}", path.display()),
        Compiled::Interpreted(_) => {
            eprintln!("warning: artifact could not be written to {}", dir.display());
        }
    }
    Ok(())
}

fn cmd_commands(file: &Path) -> Result<(), String> {
    let container = kernel_for(file)?.container().map_err(|e| e.to_string())?;
    for id in container.commands() {
        println!("{}", id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = r#"
parameters:
  greeting: hello
services:
  greeter:
    create: Greeter
    arguments: ["%greeting%"]
    type: [Greeter]
  migrate:
    create: Migrate
    tags: [console.command]
  serve:
    create: Serve
    tags: [console.command, {http.listener: {port: 8080}}]
    public: false
http:
  routes:
    - {path: /, handler: "@greeter"}
"#;

    fn write_app(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("kiln.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_kl020_init() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("fresh");
        cmd_init(&sub).unwrap();
        assert!(sub.join("kiln.yaml").exists());
        cmd_validate(&sub.join("kiln.yaml")).unwrap();
    }

    #[test]
    fn test_kl020_init_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        write_app(dir.path(), "exists");
        assert!(cmd_init(dir.path()).is_err());
    }

    #[test]
    fn test_kl020_validate_valid() {
        let dir = tempfile::tempdir().unwrap();
        cmd_validate(&write_app(dir.path(), APP)).unwrap();
    }

    #[test]
    fn test_kl020_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_app(
            dir.path(),
            "services:\n  a:\n    create: A\n    arguments: ['@ghost']\n",
        );
        let err = cmd_validate(&file).unwrap_err();
        assert_eq!(err, "1 validation error(s)");
    }

    #[test]
    fn test_kl020_validate_reports_lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_app(dir.path(), "http:\n  middleware: [{anchor: nope}]\n");
        let err = cmd_validate(&file).unwrap_err();
        assert!(err.contains("nope"), "{}", err);
    }

    #[test]
    fn test_kl020_services_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_app(dir.path(), APP);
        cmd_services(&file, None, false).unwrap();
        cmd_services(&file, Some("console.command"), true).unwrap();
    }

    #[test]
    fn test_kl020_describe_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let registry = assemble(&write_app(dir.path(), APP)).unwrap();
        let serve = registry.definition("serve").unwrap();
        assert_eq!(
            describe(serve),
            "serve [shared, private] tags: console.command, http.listener (from services)"
        );
        let json = to_json(serve);
        assert_eq!(json["tags"]["http.listener"]["port"], 8080);
        assert_eq!(json["public"], false);
        let greeter = registry.definition("greeter").unwrap();
        assert_eq!(describe(greeter), "greeter [shared] types: Greeter (from services)");
        assert!(registry.has("http.router"));
    }

    #[test]
    fn test_kl020_compile_to_stdout_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_app(dir.path(), APP);
        cmd_compile(&file, None, false).unwrap();
        let cache = dir.path().join("cache");
        cmd_compile(&file, Some(&cache), false).unwrap();
        cmd_compile(&file, Some(&cache), false).unwrap();
        cmd_compile(&file, Some(&cache), true).unwrap();
        let artifacts: Vec<_> = std::fs::read_dir(&cache)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(artifacts.len(), 2, "{:?}", artifacts);
    }

    #[test]
    fn test_kl020_commands() {
        let dir = tempfile::tempdir().unwrap();
        cmd_commands(&write_app(dir.path(), APP)).unwrap();
    }

    #[test]
    fn test_kl020_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = cmd_validate(&dir.path().join("none.yaml")).unwrap_err();
        assert!(err.contains("none.yaml"));
    }

    #[test]
    fn test_kl020_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_app(dir.path(), APP);
        dispatch(Commands::Validate { file: file.clone() }).unwrap();
        dispatch(Commands::Commands { file }).unwrap();
    }
}
