mod config;

use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flagvault_lib::{
    Caller, FlagId, FlagService, FlagStore, FlagType, MemoryStore, NewFlag, OrganizationId, Page,
    RevisionId, RuleSpec, SledStore, UserId,
};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::{parse_backend, parse_policy, FvConfig, StorageBackend};

#[derive(Parser, Debug)]
#[command(name = "fv")]
#[command(version)]
#[command(about = "Revisioned feature flags: propose, approve, roll back", long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short = 'c', long = "config", default_value = "flagvault.toml")]
    config: String,

    /// Directory of the sled database
    #[arg(long = "data-dir")]
    data_dir: Option<String>,

    /// Storage backend: sled or memory
    #[arg(long = "storage")]
    storage: Option<String>,

    /// Transition policy: strict or lenient
    #[arg(long = "policy")]
    policy: Option<String>,

    /// Acting user
    #[arg(long = "user", env = "FV_USER")]
    user: UserId,

    /// Organization the user acts for
    #[arg(long = "org", env = "FV_ORG")]
    org: OrganizationId,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a flag with a live initial revision
    Create {
        #[arg(short = 'n', long = "name")]
        name: String,

        /// boolean, string, number or json
        #[arg(short = 't', long = "type", default_value = "boolean")]
        flag_type: FlagType,

        /// Default value of the initial revision
        #[arg(short = 'v', long = "value")]
        value: String,

        /// Initial environment, created enabled
        #[arg(short = 'e', long = "env", default_value = "production")]
        env: String,

        #[arg(short = 'p', long = "project")]
        project: Option<String>,

        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Rules as a JSON array of {predicate, value, env, is_enabled}
        #[arg(long = "rules")]
        rules: Option<String>,
    },
    /// Propose a draft revision
    Propose {
        flag: FlagId,

        #[arg(short = 'v', long = "value")]
        value: String,

        /// Rules as a JSON array of {predicate, value, env, is_enabled}
        #[arg(long = "rules")]
        rules: Option<String>,
    },
    /// Promote a draft revision to live
    Approve { flag: FlagId, revision: RevisionId },
    /// Undo the last promotion
    Rollback { flag: FlagId },
    /// Flip an environment's enabled state
    Toggle { flag: FlagId, environment: String },
    /// Soft-delete a flag
    Delete { flag: FlagId },
    /// Add tags to a flag and its organization
    Tags {
        flag: FlagId,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    Show {
        flag: FlagId,

        #[arg(long = "include-deleted")]
        include_deleted: bool,
    },
    List {
        #[arg(long = "page")]
        page: Option<u32>,

        #[arg(long = "page-size")]
        page_size: Option<u32>,
    },
    Timeline { flag: FlagId },
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}

fn parse_rules(rules: Option<&str>) -> Vec<RuleSpec> {
    match rules {
        Some(json) => serde_json::from_str(json)
            .unwrap_or_else(|e| fail(format!("invalid --rules JSON: {}", e))),
        None => Vec::new(),
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => println!("{}", out),
        Err(e) => fail(e),
    }
}

async fn run<S: FlagStore>(service: FlagService<S>, caller: Caller, cmd: Command) -> flagvault_lib::Result<()> {
    match cmd {
        Command::Create {
            name,
            flag_type,
            value,
            env,
            project,
            tags,
            rules,
        } => {
            let new = NewFlag {
                name,
                flag_type,
                default_value: value,
                rules: parse_rules(rules.as_deref()),
                environment: env,
                project,
                tags,
            };
            print_json(&service.create_flag(caller, &new).await?);
        }
        Command::Propose { flag, value, rules } => {
            let rules = parse_rules(rules.as_deref());
            print_json(&service.propose(caller, flag, &value, rules).await?);
        }
        Command::Approve { flag, revision } => {
            print_json(&service.approve(caller, flag, revision).await?);
        }
        Command::Rollback { flag } => {
            print_json(&service.rollback(caller, flag).await?);
        }
        Command::Toggle { flag, environment } => {
            print_json(&service.toggle_environment(caller, flag, &environment).await?);
        }
        Command::Delete { flag } => {
            print_json(&service.delete(caller, flag).await?);
        }
        Command::Tags { flag, tags } => {
            print_json(&service.patch_tags(caller, flag, &tags).await?);
        }
        Command::Show {
            flag,
            include_deleted,
        } => {
            let found = if include_deleted {
                service.get_including_deleted(caller, flag).await?
            } else {
                service.get(caller, flag).await?
            };
            print_json(&found);
        }
        Command::List { page, page_size } => {
            print_json(&service.list(caller, Page::new(page, page_size)).await?);
        }
        Command::Timeline { flag } => {
            print_json(&service.timeline(caller, flag).await?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = FvConfig::load(&args.config);
    config.apply_env_overrides();
    if let Some(dir) = args.data_dir {
        config.storage.data_dir = dir;
    }
    if let Some(storage) = args.storage.as_deref() {
        config.storage.backend =
            parse_backend(storage).unwrap_or_else(|| fail(format!("unknown storage backend: {}", storage)));
    }
    if let Some(policy) = args.policy.as_deref() {
        config.engine.policy =
            parse_policy(policy).unwrap_or_else(|| fail(format!("unknown policy: {}", policy)));
    }

    let filter = EnvFilter::try_new(&config.log.filter).unwrap_or_else(|e| {
        eprintln!("Warning: invalid log filter {:?}: {}", config.log.filter, e);
        EnvFilter::new("warn")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    debug!(?config, "configuration loaded");

    let caller = Caller::new(args.user, args.org);
    let policy = config.engine.policy;
    let result = match config.storage.backend {
        StorageBackend::Sled => {
            let store = SledStore::open(&config.storage.data_dir).unwrap_or_else(|e| fail(e));
            run(FlagService::new(Arc::new(store), policy), caller, args.cmd).await
        }
        StorageBackend::Memory => {
            run(FlagService::new(Arc::new(MemoryStore::new()), policy), caller, args.cmd).await
        }
    };

    if let Err(e) = result {
        fail(e);
    }
}
