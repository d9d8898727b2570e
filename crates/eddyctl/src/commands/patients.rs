//! Patient registration and search commands.

use anyhow::{Context, Result};
use clap::Args;
use eddy::patients::{self, NewPatient, Patient};
use eddy::Connection;
use serde::Serialize;

use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct RegisterArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    /// Date of birth, YYYY-MM-DD
    #[arg(long = "dob")]
    date_of_birth: String,
    #[arg(long)]
    gender: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    address: Option<String>,
    #[arg(long)]
    medical_history: Option<String>,
}

impl From<RegisterArgs> for NewPatient {
    fn from(args: RegisterArgs) -> Self {
        Self {
            first_name: args.first_name,
            last_name: args.last_name,
            date_of_birth: args.date_of_birth,
            gender: args.gender,
            email: args.email,
            phone: args.phone,
            address: args.address,
            medical_history: args.medical_history,
        }
    }
}

#[derive(Serialize)]
struct SearchOutput {
    patients: Vec<Patient>,
    total: usize,
}

pub async fn register(conn: &Connection, args: RegisterArgs, format: OutputFormat) -> Result<()> {
    let patient = patients::register(conn, &args.into())
        .await
        .context("failed to register patient")?;

    match format {
        OutputFormat::Text => println!("Registered patient #{}: {}", patient.id, patient.full_name()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&patient)?),
    }
    Ok(())
}

pub async fn search(conn: &Connection, term: &str, format: OutputFormat) -> Result<()> {
    let found = patients::search(conn, term).await.context("search failed")?;
    let output = SearchOutput {
        total: found.len(),
        patients: found,
    };

    match format {
        OutputFormat::Text => {
            if output.patients.is_empty() {
                println!("No patients found.");
            } else {
                println!(
                    "{:>6}  {:<30} {:<12} {:<10} {:<30}",
                    "ID", "NAME", "BORN", "GENDER", "CONTACT"
                );
                println!("{}", "-".repeat(92));
                for p in &output.patients {
                    let contact = p.email.as_deref().or(p.phone.as_deref()).unwrap_or("-");
                    println!(
                        "{:>6}  {:<30} {:<12} {:<10} {:<30}",
                        p.id,
                        p.full_name(),
                        p.date_of_birth,
                        p.gender,
                        contact
                    );
                }
                println!();
                println!("Total: {} patient(s)", output.total);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
    }
    Ok(())
}
