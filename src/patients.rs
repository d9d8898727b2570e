//! Patient registry operations over a [`Connection`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::live::Subscription;
use crate::store::rows::{ResultSet, Row};

/// Live list of patients, newest first.
pub const RECENT_PATIENTS_SQL: &str = "SELECT * FROM patients ORDER BY created_at DESC, id DESC";

const INSERT_PATIENT_SQL: &str = r#"
INSERT INTO patients (first_name, last_name, date_of_birth, gender, email, phone, address, medical_history)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
RETURNING *
"#;

const SEARCH_PATIENTS_SQL: &str = r#"
SELECT * FROM patients
WHERE first_name LIKE $1 OR last_name LIKE $1 OR email LIKE $1
ORDER BY created_at DESC, id DESC
"#;

const COUNT_BY_GENDER_SQL: &str =
    "SELECT gender, count(*) AS total FROM patients GROUP BY gender ORDER BY gender";

/// A patient as entered on the registration form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPatient {
    pub first_name: String,
    pub last_name: String,
    /// ISO date, `YYYY-MM-DD`
    pub date_of_birth: String,
    pub gender: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub medical_history: Option<String>,
}

impl NewPatient {
    /// Check the required fields are filled in.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("first_name", &self.first_name),
            ("last_name", &self.last_name),
            ("date_of_birth", &self.date_of_birth),
            ("gender", &self.gender),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Query(format!("{field} is required")));
            }
        }
        Ok(())
    }

    fn params(&self) -> Vec<Value> {
        // Blank optional fields are stored as NULL.
        let optional = |v: &Option<String>| match v.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => json!(s),
            _ => Value::Null,
        };
        vec![
            json!(self.first_name.trim()),
            json!(self.last_name.trim()),
            json!(self.date_of_birth.trim()),
            json!(self.gender.trim()),
            optional(&self.email),
            optional(&self.phone),
            optional(&self.address),
            optional(&self.medical_history),
        ]
    }
}

/// A registered patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
    pub gender: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub medical_history: Option<String>,
    /// RFC 3339 UTC timestamp set by the store
    pub created_at: String,
}

impl Patient {
    /// Decode a `patients` row.
    pub fn from_row(row: &Row) -> Result<Self> {
        serde_json::from_value(Value::Object(row.clone()))
            .map_err(|e| Error::Query(format!("malformed patient row: {e}")))
    }

    /// Decode every row of a result.
    pub fn from_result(result: &ResultSet) -> Result<Vec<Self>> {
        result.rows.iter().map(Self::from_row).collect()
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Register a patient and return the stored record.
pub async fn register(conn: &Connection, patient: &NewPatient) -> Result<Patient> {
    patient.validate()?;
    let result = conn.query(INSERT_PATIENT_SQL, &patient.params()).await?;
    let row = result
        .rows
        .first()
        .ok_or_else(|| Error::Query("insert returned no row".into()))?;
    let stored = Patient::from_row(row)?;

    tracing::info!(patient_id = stored.id, "Patient registered");
    Ok(stored)
}

/// Case-insensitive substring search over names and email, newest first.
///
/// An empty term matches everyone.
pub async fn search(conn: &Connection, term: &str) -> Result<Vec<Patient>> {
    let pattern = format!("%{}%", term.trim());
    let result = conn.query(SEARCH_PATIENTS_SQL, &[json!(pattern)]).await?;
    Patient::from_result(&result)
}

/// Number of patients per gender, ordered by gender.
pub async fn count_by_gender(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let result = conn.query(COUNT_BY_GENDER_SQL, &[]).await?;
    result
        .rows
        .iter()
        .map(|row| {
            let gender = row.get("gender").and_then(Value::as_str);
            let total = row.get("total").and_then(Value::as_i64);
            match (gender, total) {
                (Some(gender), Some(total)) => Ok((gender.to_string(), total)),
                _ => Err(Error::Query("malformed gender count row".into())),
            }
        })
        .collect()
}

/// Keep a live list of patients, newest first.
///
/// Returns the current list and the subscription feeding `on_update`.
pub async fn watch_recent<F>(conn: &Connection, mut on_update: F) -> Result<(Vec<Patient>, Subscription)>
where
    F: FnMut(Result<Vec<Patient>>) + Send + 'static,
{
    let live = conn
        .subscribe(RECENT_PATIENTS_SQL, &[], move |result| {
            on_update(result.and_then(|rs| Patient::from_result(&rs)));
        })
        .await?;
    let initial = Patient::from_result(&live.initial)?;
    Ok((initial, live.subscription))
}
