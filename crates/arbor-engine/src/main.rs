use anyhow::{bail, Context};
use arbor_engine::hierarchy::BranchTreeNode;
use arbor_engine::{BranchEngine, EngineConfig, VotingType};
use arbor_store::MemoryStore;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("arbor")
        .version(arbor_engine::VERSION)
        .about("Operate the branch engine over a store snapshot")
        .arg_required_else_help(true)
        .arg(
            Arg::new("store")
                .long("store")
                .global(true)
                .default_value("arbor-store.json")
                .value_parser(value_parser!(PathBuf))
                .help("Store snapshot file (created if missing)"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Engine configuration TOML"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Debug logging unless RUST_LOG is set"),
        )
        .subcommand(
            Command::new("maintain")
                .about("Run the maintenance sweep")
                .arg(
                    Arg::new("story")
                        .long("story")
                        .help("Sweep one story instead of all"),
                ),
        )
        .subcommand(
            Command::new("tree")
                .about("Print a story's branch tree")
                .arg(Arg::new("story").long("story").required(true)),
        )
        .subcommand(
            Command::new("vote")
                .about("Cast a vote on a branch")
                .arg(Arg::new("branch").long("branch").required(true))
                .arg(Arg::new("voter").long("voter").required(true))
                .arg(
                    Arg::new("type")
                        .long("type")
                        .default_value("merge")
                        .help("merge, keep_separate or delete"),
                )
                .arg(
                    Arg::new("reject")
                        .long("reject")
                        .action(ArgAction::SetTrue)
                        .help("Vote against"),
                ),
        )
        .subcommand(
            Command::new("merge")
                .about("Merge an approved branch into a target")
                .arg(Arg::new("source").long("source").required(true))
                .arg(Arg::new("target").long("target").required(true)),
        )
        .subcommand(
            Command::new("popularity")
                .about("Rescore a story and list its top branches")
                .arg(Arg::new("story").long("story").required(true))
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .default_value("10")
                        .value_parser(value_parser!(usize)),
                ),
        )
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn required<'a>(args: &'a ArgMatches, name: &str) -> anyhow::Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing --{name}"))
}

fn print_node(node: &BranchTreeNode) {
    let b = &node.branch;
    let marker = if b.is_active { "" } else { " (inactive)" };
    let candidate = if b.merge_candidate { " [merge candidate]" } else { "" };
    println!(
        "{:indent$}{} {} pop={}{marker}{candidate}",
        "",
        b.id,
        b.name,
        b.popularity,
        indent = node.depth * 2
    );
    for child in &node.children {
        print_node(child);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("verbose"));

    let config = match matches.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let store_path = matches
        .get_one::<PathBuf>("store")
        .cloned()
        .context("missing --store")?;
    let store = Arc::new(
        MemoryStore::load_file(&store_path)
            .await
            .with_context(|| format!("reading {}", store_path.display()))?,
    );
    let engine = BranchEngine::new(store.clone(), config);

    match matches.subcommand() {
        Some(("maintain", args)) => {
            let reports = match args.get_one::<String>("story") {
                Some(story_id) => vec![engine.run_branch_maintenance(story_id).await],
                None => engine.run_all_maintenance().await,
            };
            for report in &reports {
                println!("{}: {}", report.story_id, report.message);
                for id in &report.cleaned_branches {
                    println!("  deactivated {id}");
                }
                for result in &report.merge_results {
                    println!("  {} -> {}: {}", result.source_id, result.target_id, result.message);
                }
            }
        }
        Some(("tree", args)) => {
            let story_id = required(args, "story")?;
            let Some(tree) = engine.get_branch_tree(story_id).await else {
                bail!("no usable branch tree for story {story_id}");
            };
            for root in &tree.roots {
                print_node(root);
            }
            println!(
                "total={} active={} max_depth={}",
                tree.total_branches, tree.active_branches, tree.max_depth
            );
        }
        Some(("vote", args)) => {
            let branch_id = required(args, "branch")?;
            let voter_id = required(args, "voter")?;
            let voting_type: VotingType = required(args, "type")?.parse()?;
            let approve = !args.get_flag("reject");

            let session = engine.cast_vote(branch_id, voting_type, voter_id, approve).await?;
            println!(
                "{} vote on {}: {}/{} for, status {:?}, deadline {}",
                session.voting_type,
                session.branch_id,
                session.votes_for.len(),
                session.total_votes,
                session.status,
                session.deadline
            );
        }
        Some(("merge", args)) => {
            let result = engine
                .merge_branch(required(args, "source")?, required(args, "target")?)
                .await;
            println!("{}", result.message);
            if !result.success {
                store.save_file(&store_path).await?;
                std::process::exit(1);
            }
        }
        Some(("popularity", args)) => {
            let story_id = required(args, "story")?;
            let limit = args.get_one::<usize>("limit").copied().unwrap_or(10);
            let refreshed = engine.popularity().refresh_story(story_id).await;
            println!("rescored {refreshed} branches");
            for branch in engine.repository().top_branches(story_id, limit).await? {
                println!("{:>6}  {} {}", branch.popularity, branch.id, branch.name);
            }
        }
        _ => bail!("no subcommand given, see --help"),
    }

    store
        .save_file(&store_path)
        .await
        .with_context(|| format!("writing {}", store_path.display()))?;
    Ok(())
}
