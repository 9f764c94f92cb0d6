mod calculator;
mod drainer;
mod loader;
mod models;
mod normalizer;

use anyhow::Result;
use clap::{Arg, Command};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use calculator::{CalculationResult, VarsityCalculator};
use drainer::{DrainedResult, Drainer};
use models::{Config, VarsityPayload};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = Command::new("varsity-analyzer")
        .version("1.0")
        .about("Computes quota-based admission outcomes and withdrawal simulations")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .get_matches();

    let config_file = matches.get_one::<String>("config").unwrap();

    // Load or create configuration
    let config = if Path::new(config_file).exists() {
        println!("📋 Loading configuration from: {}", config_file);
        Config::load_from_file(config_file)?
    } else {
        println!("📝 Creating default configuration file: {}", config_file);
        let default_config = Config::default();
        default_config.save_to_file(config_file)?;
        println!(
            "⚠️  Please edit {} and point it at your headings/applications files, then run again.",
            config_file
        );
        return Ok(());
    };

    // Validate configuration
    if config.drain_iterations == 0 {
        println!("❌ Error: drain_iterations must be greater than zero");
        return Ok(());
    }

    let output_dir = config.output_directory.as_deref().unwrap_or("output");
    fs::create_dir_all(output_dir)?;
    clean_output_directory(output_dir)?;

    println!("🎓 Varsity: {} ({})", config.varsity_name, config.varsity_code);
    println!("📄 Headings file: {}", config.headings_file);
    println!("📄 Applications files: {}", config.applications_files.join(", "));
    println!("📂 Output directory: {} (cleaned)", output_dir);

    let vc = loader::load_varsity(&config).await?;
    println!(
        "✅ Loaded {} headings and {} students",
        vc.headings().len(),
        vc.students().len()
    );

    println!("\n🧮 Calculating primary admissions...");
    let primary = vc.calculate_admissions()?;

    let mut drained: BTreeMap<u8, Vec<DrainedResult>> = BTreeMap::new();
    for &percent in &config.drain_percents {
        println!(
            "🎲 Simulating {}% drain over {} iterations...",
            percent, config.drain_iterations
        );
        let drainer = Drainer::new(vc.clone(), percent)?;
        let results = drainer.run(config.drain_iterations).await?;
        println!("   ✅ {} headings produced statistics", results.len());
        drained.insert(percent, results);
    }

    generate_admitted_csvs(&primary, output_dir)?;
    generate_drained_report(&drained, output_dir)?;

    print_summary(&primary);
    if let Some(target) = &config.target_student_id {
        print_target_summary(&vc, &primary, &drained, target);
    }

    let payload = VarsityPayload::from_parts(&vc, &primary, drained);
    generate_payload_json(&payload, output_dir)?;

    println!("\n✅ Analysis complete!");
    println!("📂 Results written to: {}", output_dir);
    Ok(())
}

fn safe_file_name(code: &str) -> String {
    code.replace('/', "_").replace(' ', "_")
}

// Per-heading CSV of the final admitted lists, in engine order.
fn generate_admitted_csvs(primary: &[CalculationResult], output_dir: &str) -> Result<()> {
    use csv::Writer;

    let admitted_dir = Path::new(output_dir).join("admitted_lists");
    fs::create_dir_all(&admitted_dir)?;

    for result in primary {
        let csv_path = admitted_dir.join(format!("{}_admitted.csv", safe_file_name(&result.heading_code)));
        let mut writer = Writer::from_path(csv_path)?;

        writer.write_record([
            "Position",
            "Student_ID",
            "Competition",
            "Rating_Place",
            "Score",
            "Original_Submitted",
        ])?;

        for (i, entry) in result.admitted.iter().enumerate() {
            writer.write_record([
                &(i + 1).to_string(),
                &entry.student_id,
                &entry.competition.to_string(),
                &entry.rating_place.to_string(),
                &entry.score.to_string(),
                &entry.original_submitted.to_string(),
            ])?;
        }

        writer.flush()?;
    }

    Ok(())
}

fn generate_drained_report(
    drained: &BTreeMap<u8, Vec<DrainedResult>>,
    output_dir: &str,
) -> Result<()> {
    use csv::Writer;

    let mut content = String::new();
    content.push_str("Drained Admission Statistics\n");
    content.push_str("============================\n\n");

    let csv_path = Path::new(output_dir).join("drained_statistics.csv");
    let mut writer = Writer::from_path(csv_path)?;
    writer.write_record([
        "Drained_Percent",
        "Heading_Code",
        "Min_Passing_Score",
        "Med_Passing_Score",
        "Avg_Passing_Score",
        "Max_Passing_Score",
        "Min_Last_Admitted_Rating_Place",
        "Med_Last_Admitted_Rating_Place",
        "Avg_Last_Admitted_Rating_Place",
        "Max_Last_Admitted_Rating_Place",
        "Iterations_Counted",
    ])?;

    for (percent, results) in drained {
        content.push_str(&format!("Drain percent: {}%\n", percent));
        for result in results {
            content.push_str(&format!(
                "   {}: passing score min/med/avg/max = {}/{}/{}/{}; \
                last rating place min/med/avg/max = {}/{}/{}/{} ({} iterations)\n",
                result.heading_code,
                result.min_passing_score,
                result.med_passing_score,
                result.avg_passing_score,
                result.max_passing_score,
                result.min_last_admitted_rating_place,
                result.med_last_admitted_rating_place,
                result.avg_last_admitted_rating_place,
                result.max_last_admitted_rating_place,
                result.iterations_counted,
            ));

            writer.write_record([
                &percent.to_string(),
                &result.heading_code,
                &result.min_passing_score.to_string(),
                &result.med_passing_score.to_string(),
                &result.avg_passing_score.to_string(),
                &result.max_passing_score.to_string(),
                &result.min_last_admitted_rating_place.to_string(),
                &result.med_last_admitted_rating_place.to_string(),
                &result.avg_last_admitted_rating_place.to_string(),
                &result.max_last_admitted_rating_place.to_string(),
                &result.iterations_counted.to_string(),
            ])?;
        }
        content.push('\n');
    }

    writer.flush()?;
    fs::write(Path::new(output_dir).join("drained_statistics.txt"), content)?;
    Ok(())
}

fn generate_payload_json(payload: &VarsityPayload, output_dir: &str) -> Result<()> {
    let content = serde_json::to_string_pretty(payload)?;
    fs::write(Path::new(output_dir).join("payload.json"), content)?;
    Ok(())
}

fn print_summary(primary: &[CalculationResult]) {
    println!("\n📊 PRIMARY ADMISSION SUMMARY");
    println!("============================\n");

    for result in primary {
        match (result.passing_score(), result.last_admitted_rating_place()) {
            (Ok(score), Ok(place)) => println!(
                "   {} ({}): {} admitted, passing score {}, last rating place {}",
                result.heading_code,
                result.heading_name,
                result.admitted.len(),
                score,
                place
            ),
            _ => println!(
                "   {} ({}): nobody admitted",
                result.heading_code, result.heading_name
            ),
        }
    }
}

fn print_target_summary(
    vc: &VarsityCalculator,
    primary: &[CalculationResult],
    drained: &BTreeMap<u8, Vec<DrainedResult>>,
    target_id: &str,
) {
    println!("\n🎯 Target Student Results: {}", target_id);

    let student = match vc.student(target_id) {
        Some(student) => student,
        None => {
            println!("   ❓ Student not found in any application list");
            return;
        }
    };

    for app in &student.applications {
        let heading = &vc.headings()[app.heading];
        let position = primary
            .iter()
            .find(|r| r.heading_code == heading.code)
            .and_then(|r| {
                r.admitted
                    .iter()
                    .position(|e| e.student_id == target_id)
                    .map(|pos| (pos + 1, r.admitted.len()))
            });

        match position {
            Some((pos, total)) => println!(
                "   ✅ {} (priority {}, {}): admitted at position {} of {}",
                heading.code, app.priority, app.competition, pos, total
            ),
            None => println!(
                "   ❌ {} (priority {}, {}): not admitted",
                heading.code, app.priority, app.competition
            ),
        }

        for (percent, results) in drained {
            if let Some(result) = results.iter().find(|r| r.heading_code == heading.code) {
                println!(
                    "      {}% drain: median passing score {}, median last rating place {}",
                    percent, result.med_passing_score, result.med_last_admitted_rating_place
                );
            }
        }
    }
}

// Clean up previous results from output directory
fn clean_output_directory(output_dir: &str) -> Result<()> {
    let output_path = Path::new(output_dir);

    if !output_path.exists() {
        return Ok(());
    }

    let items_to_clean = [
        "payload.json",
        "drained_statistics.txt",
        "drained_statistics.csv",
        "admitted_lists",
    ];

    for item in &items_to_clean {
        let item_path = output_path.join(item);

        if item_path.exists() {
            if item_path.is_file() {
                fs::remove_file(&item_path)?;
            } else if item_path.is_dir() {
                fs::remove_dir_all(&item_path)?;
            }
        }
    }

    Ok(())
}
