//! Upstream collaborators: the weather provider and the settlement ledger.

pub mod ledger;
pub mod weather;

pub use ledger::{EventEnvelope, EventPage, HttpLedgerClient, SettlementLedger, SubmissionReceipt};
pub use weather::{HourlyReading, OpenMeteoClient, WeatherProvider};
