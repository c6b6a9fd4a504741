use anyhow::Result;

use crate::config::Config;
use crate::db::{count_bets, count_offers, create_pool, init_database_with_pool};
use crate::models::MarketKind;
use crate::services::{build_opportunities, EvScorer, OddsClient, PersistenceWriter};

/// One-shot fetch-analyse-persist cycle from the command line, bypassing the
/// scheduler entirely. Useful for smoke-testing an API key and for cron-style
/// collection without the server running.
pub async fn fetch_once(config: &Config, sport: Option<&str>) -> Result<()> {
    let pool = create_pool(&config.database_url).await?;
    init_database_with_pool(&pool).await?;

    let sports: Vec<String> = match sport {
        Some("all") | None => config.sport_keys.clone(),
        Some(key) => vec![key.to_string()],
    };

    println!("📥 Fetching odds for {}...", sports.join(", "));
    let client = OddsClient::new(config)?;
    let snapshot = client.fetch_snapshot(&sports, &MarketKind::all()).await?;
    println!("   {} events in snapshot", snapshot.events.len());

    let scorer = EvScorer::new(config.exchange_fee(), config.exchange_books.clone());
    let opportunities = build_opportunities(&snapshot, &scorer);
    println!("   {} opportunities assembled", opportunities.len());

    let writer = PersistenceWriter::new(pool.clone());
    let stats = writer.persist_cycle(&opportunities).await;
    println!(
        "✅ Persisted: {} bets touched, {} offers appended ({} total bets, {} total offers)",
        stats.bets,
        stats.offers,
        count_bets(&pool).await?,
        count_offers(&pool).await?,
    );

    Ok(())
}

/// Run the pipeline once and print the ranked opportunity list without
/// touching the database.
pub async fn analyze(config: &Config) -> Result<()> {
    println!("🔍 Analyzing current odds...");
    let client = OddsClient::new(config)?;
    let snapshot = client
        .fetch_snapshot(&config.sport_keys, &MarketKind::all())
        .await?;

    let scorer = EvScorer::new(config.exchange_fee(), config.exchange_books.clone());
    let opportunities = build_opportunities(&snapshot, &scorer);

    if opportunities.is_empty() {
        println!("📭 No opportunities found. Upstream may be between slates.");
        return Ok(());
    }

    println!("💰 Top opportunities:\n");
    for (i, opp) in opportunities.iter().take(15).enumerate() {
        println!(
            "{:>2}. {:+.2}%  {:<18} {} | {} ({} {:+})",
            i + 1,
            opp.ev_pct,
            opp.ev_class.as_str(),
            opp.event,
            opp.bet_description,
            opp.best_book,
            opp.best_odds,
        );
    }
    println!("\n{} opportunities total across {} events", opportunities.len(), snapshot.events.len());

    Ok(())
}

pub async fn init_db(config: &Config) -> Result<()> {
    let pool = create_pool(&config.database_url).await?;
    init_database_with_pool(&pool).await?;
    println!("✅ Database initialized");
    Ok(())
}
