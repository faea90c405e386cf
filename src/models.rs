use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TripCategory {
    Leisure,
    Business,
    Study,
    Other,
}

impl TripCategory {
    /// Display label, kept apart from the serialized identity.
    pub fn label(self) -> &'static str {
        match self {
            TripCategory::Leisure => "Leisure",
            TripCategory::Business => "Business",
            TripCategory::Study => "Study",
            TripCategory::Other => "Other",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TripCategory::Leisure => "leisure",
            TripCategory::Business => "business",
            TripCategory::Study => "study",
            TripCategory::Other => "other",
        }
    }
}

impl FromStr for TripCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leisure" => Ok(TripCategory::Leisure),
            "business" => Ok(TripCategory::Business),
            "study" => Ok(TripCategory::Study),
            "other" => Ok(TripCategory::Other),
            other => Err(format!("unknown trip category: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub id: i64,
    pub destination: String,
    pub category: TripCategory,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub budget: f64,
}

/// Trip fields as submitted by a client, before an id is assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrip {
    pub destination: String,
    pub category: TripCategory,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub budget: f64,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripValidationError {
    #[error("destination must not be blank")]
    BlankDestination,
    #[error("end date must not precede start date")]
    EndBeforeStart,
    #[error("budget must not be negative")]
    NegativeBudget,
}

impl NewTrip {
    pub fn validate(&self) -> Result<(), TripValidationError> {
        if self.destination.trim().is_empty() {
            return Err(TripValidationError::BlankDestination);
        }
        if self.end_date < self.start_date {
            return Err(TripValidationError::EndBeforeStart);
        }
        if self.budget < 0.0 {
            return Err(TripValidationError::NegativeBudget);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserValidationError {
    #[error("name must not be blank")]
    BlankName,
    #[error("email is not valid")]
    InvalidEmail,
    #[error("password must be at least 6 characters")]
    ShortPassword,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), UserValidationError> {
        if self.name.trim().is_empty() {
            return Err(UserValidationError::BlankName);
        }
        if !self.email.contains('@') || self.email.trim().is_empty() {
            return Err(UserValidationError::InvalidEmail);
        }
        if self.password.chars().count() < 6 {
            return Err(UserValidationError::ShortPassword);
        }
        Ok(())
    }
}
