use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use pawcare_core::{choice_param, list_param, NewLostReport, PetFilters, PriceRange, ProviderFilters, User};
use pawcare_services::{connect_data_source, Catalog, LostPetService, PawcareConfig, StatsAggregator};
use pawcare_storage::{IdentityProvider, StaticIdentity};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pawcare-cli")]
#[command(about = "PawCare marketplace command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search caregivers and veterinary clinics.
    Providers(ProviderArgs),
    /// Search pets up for adoption.
    Pets {
        #[arg(long)]
        location: Option<String>,
        #[arg(long)]
        pet_type: Option<String>,
        #[arg(long)]
        size: Option<String>,
        #[arg(long)]
        age: Option<String>,
    },
    /// Dashboard counters for a user.
    Stats {
        #[arg(long)]
        user: Option<String>,
    },
    ReportLost {
        #[arg(long)]
        user: String,
        #[arg(long)]
        pet: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        last_seen_location: Option<String>,
        #[arg(long)]
        contact_phone: Option<String>,
    },
    MarkFound {
        #[arg(long)]
        user: String,
        #[arg(long)]
        report: String,
    },
    DeleteReport {
        #[arg(long)]
        user: String,
        #[arg(long)]
        report: String,
    },
    Serve,
}

#[derive(Debug, Args)]
struct ProviderArgs {
    #[arg(long)]
    location: Option<String>,
    #[arg(long)]
    pet_type: Option<String>,
    #[arg(long, requires = "max_price")]
    min_price: Option<f64>,
    #[arg(long, requires = "min_price")]
    max_price: Option<f64>,
    /// Repeatable; also accepts comma separated values.
    #[arg(long = "service")]
    services: Vec<String>,
    #[arg(long)]
    certified_only: bool,
}

impl ProviderArgs {
    fn into_filters(self) -> Result<ProviderFilters> {
        let price = match (self.min_price, self.max_price) {
            (Some(min), Some(max)) => {
                let range = PriceRange::new(min, max);
                if !range.is_valid() {
                    bail!("--min-price and --max-price must be finite with min <= max");
                }
                Some(range)
            }
            _ => None,
        };
        Ok(ProviderFilters {
            location: choice_param(self.location.as_deref()),
            pet_type: choice_param(self.pet_type.as_deref()),
            price,
            services: self
                .services
                .iter()
                .flat_map(|raw| list_param(Some(raw.as_str())))
                .collect(),
            certified_only: self.certified_only,
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn identity(user: Option<String>) -> Arc<dyn IdentityProvider> {
    Arc::new(StaticIdentity::from(user.map(User::new)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = PawcareConfig::from_env();

    let source = || connect_data_source(&config);

    match cli.command {
        Commands::Serve => pawcare_web::serve(config.clone()).await?,
        Commands::Providers(args) => {
            let filters = args.into_filters()?;
            print_json(&Catalog::new(source().await?).search_providers(&filters).await?)?;
        }
        Commands::Pets {
            location,
            pet_type,
            size,
            age,
        } => {
            let filters = PetFilters {
                location: choice_param(location.as_deref()),
                pet_type: choice_param(pet_type.as_deref()),
                size: choice_param(size.as_deref()),
                age: choice_param(age.as_deref()),
            };
            print_json(&Catalog::new(source().await?).search_pets(&filters).await?)?;
        }
        Commands::Stats { user } => {
            let stats = StatsAggregator::new(source().await?, identity(user))
                .compute_user_stats()
                .await;
            print_json(&stats)?;
        }
        Commands::ReportLost {
            user,
            pet,
            description,
            last_seen_location,
            contact_phone,
        } => {
            let details = NewLostReport {
                description,
                last_seen_location,
                last_seen_at: None,
                contact_phone,
            };
            let report = LostPetService::new(source().await?, identity(Some(user)))
                .report_lost(&pet, details)
                .await?;
            print_json(&report)?;
        }
        Commands::MarkFound { user, report } => {
            let report = LostPetService::new(source().await?, identity(Some(user)))
                .mark_found(&report)
                .await?;
            print_json(&report)?;
        }
        Commands::DeleteReport { user, report } => {
            LostPetService::new(source().await?, identity(Some(user.clone())))
                .delete_report(&report, &user)
                .await?;
            eprintln!("deleted lost pet report {report}");
        }
    }

    Ok(())
}
