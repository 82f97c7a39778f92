// src/cli/report.rs — Front and insight listings

use crate::infra::config::Config;
use crate::memory::{self, stratum_label, FrontSnapshot, InsightFilter, ObjectiveStore};

/// `sciloop front`: latest ranked front per stratum.
pub async fn show_front(config: &Config, stratum: Option<&str>, json: bool) -> anyhow::Result<()> {
    let db_path = config.storage.db_path();
    if !db_path.exists() {
        println!("No experiments recorded yet.");
        return Ok(());
    }
    let store = memory::open(&db_path)?;
    let fronts = store.latest_fronts(stratum)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&fronts)?);
    } else if fronts.is_empty() {
        println!("No front snapshots yet.");
    } else {
        print_fronts(&fronts);
    }
    Ok(())
}

pub fn print_fronts(fronts: &[FrontSnapshot]) {
    for snapshot in fronts {
        let front = &snapshot.front;
        let dropped = if front.dropped > 0 {
            format!(", {} dropped", front.dropped)
        } else {
            String::new()
        };
        println!(
            "Front {} (cycle {}, {} member(s){dropped})",
            stratum_label(front.stratum.as_deref()),
            snapshot.cycle,
            front.members.len()
        );
        for member in &front.members {
            let r = &member.result;
            println!(
                "  #{:<3} {}  {}  [{}]",
                member.rank,
                r.config_id(),
                format_pairs(r.objectives.iter().map(|(k, v)| (k.as_str(), format!("{v:.3}")))),
                format_pairs(
                    r.configuration
                        .params()
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.to_string()))
                ),
            );
        }
    }
}

/// `sciloop insights`: most recent analyzer output.
pub async fn show_insights(config: &Config, cycle: Option<u32>, limit: usize) -> anyhow::Result<()> {
    let db_path = config.storage.db_path();
    if !db_path.exists() {
        println!("No insights recorded yet.");
        return Ok(());
    }
    let store = memory::open(&db_path)?;
    let mut filter = InsightFilter::all().limit(limit);
    if let Some(c) = cycle {
        filter = filter.cycle(c);
    }
    let insights = store.query_insights(&filter)?;
    if insights.is_empty() {
        println!("No insights recorded yet.");
        return Ok(());
    }
    for insight in insights {
        println!(
            "[cycle {}] {} ({})",
            insight.cycle,
            insight.created_at.format("%Y-%m-%d %H:%M:%S"),
            insight.source
        );
        for line in insight.summary.lines() {
            println!("  {line}");
        }
    }
    Ok(())
}

fn format_pairs<'a>(pairs: impl Iterator<Item = (&'a str, String)>) -> String {
    pairs
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_pairs() {
        let pairs = vec![("psnr", "25.000".to_string()), ("latency", "40.000".to_string())];
        assert_eq!(
            format_pairs(pairs.into_iter()),
            "psnr=25.000 latency=40.000"
        );
    }

    #[tokio::test]
    async fn test_missing_database_is_not_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.db_path = Some(dir.path().join("none.db").display().to_string());
        show_front(&config, None, false).await.unwrap();
        show_insights(&config, Some(1), 5).await.unwrap();
        assert!(!dir.path().join("none.db").exists());
    }
}
