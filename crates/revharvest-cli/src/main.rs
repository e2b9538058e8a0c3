use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use revharvest_adapters::OrderingPolicy;
use revharvest_sync::{
    load_hotel_list, run_crawl, run_load, run_merge, run_migrate, run_watermarks, CrawlPlan,
    CrawlTargets, HarvestConfig, UpsertMode, DEFAULT_MAX_HOTELS, DEFAULT_REVIEWS_PER_HOTEL,
    DEFAULT_SEARCH_ENTRY_POINT,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "revharvest")]
#[command(about = "Incremental hotel review harvesting and ingestion")]
struct Cli {
    /// Overrides REVHARVEST_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl hotels and checkpoint reviews to a run-output file.
    Crawl(CrawlArgs),
    /// Merge run outputs into the canonical file.
    Merge {
        /// Files or directories; defaults to the data directory.
        inputs: Vec<PathBuf>,
    },
    /// Upsert the canonical file into the review database.
    Load {
        #[arg(long, value_enum, default_value_t = LoadMode::Append)]
        mode: LoadMode,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Create or update the review table schema.
    Migrate,
    /// Print the latest stored review date per hotel.
    Watermarks,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CrawlMode {
    Multiple,
    Single,
    List,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LoadMode {
    Append,
    Refresh,
}

impl From<LoadMode> for UpsertMode {
    fn from(mode: LoadMode) -> Self {
        match mode {
            LoadMode::Append => UpsertMode::Append,
            LoadMode::Refresh => UpsertMode::Refresh,
        }
    }
}

#[derive(Debug, clap::Args)]
struct CrawlArgs {
    #[arg(long, value_enum, default_value_t = CrawlMode::Multiple)]
    mode: CrawlMode,
    #[arg(long, default_value_t = DEFAULT_MAX_HOTELS)]
    max_hotels: usize,
    #[arg(long = "reviews", default_value_t = DEFAULT_REVIEWS_PER_HOTEL)]
    reviews_per_hotel: usize,
    /// Listing page to discover hotels from (multiple mode).
    #[arg(long, default_value = DEFAULT_SEARCH_ENTRY_POINT)]
    url: String,
    #[arg(long, required_if_eq("mode", "single"))]
    single_url: Option<String>,
    /// YAML file with `hotels: [{url, name?}]` (list mode).
    #[arg(long, required_if_eq("mode", "list"))]
    list: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    headless: bool,
    /// Assume newest-first review order without checking it.
    #[arg(long)]
    trust_ordering: bool,
}

impl CrawlArgs {
    fn into_plan(self, config: &HarvestConfig) -> Result<CrawlPlan> {
        let targets = match self.mode {
            CrawlMode::Multiple => CrawlTargets::Search {
                entry_point: self.url,
            },
            CrawlMode::Single => CrawlTargets::Single {
                url: self.single_url.context("--single-url is required in single mode")?,
            },
            CrawlMode::List => {
                let path = self.list.context("--list is required in list mode")?;
                CrawlTargets::List {
                    hotels: load_hotel_list(&path)?,
                }
            }
        };
        let output = self
            .output
            .unwrap_or_else(|| config.default_output_path(chrono::Utc::now()));
        let mut plan = CrawlPlan::new(targets, output);
        plan.max_hotels = self.max_hotels;
        plan.reviews_per_hotel = self.reviews_per_hotel;
        if self.trust_ordering {
            plan.ordering = OrderingPolicy::TrustOrdering;
        }
        Ok(plan)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("revharvest=info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = HarvestConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    match cli.command {
        Commands::Crawl(args) => {
            if args.headless {
                config.headless = true;
            }
            let plan = args.into_plan(&config)?;
            let summary = run_crawl(&config, &plan).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Merge { inputs } => {
            let report = run_merge(&config, &inputs).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Load { mode, file } => {
            let file = file.unwrap_or_else(|| config.canonical_path());
            let report = run_load(&config, &file, mode.into()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            run_migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Watermarks => {
            let marks = run_watermarks(&config).await?;
            for (hotel, date) in marks.iter() {
                println!("{date}\t{hotel}");
            }
        }
    }

    Ok(())
}
