pub mod candle_store;
pub mod feature_store;
pub mod gap_store;
pub mod inference_log;
pub mod model_registry;

pub use candle_store::CandleStore;
pub use feature_store::FeatureStore;
pub use gap_store::{GapSegment, GapStatus, GapStore};
pub use inference_log::{InferenceLog, InferenceRecord};
pub use model_registry::{ModelRegistry, ModelRow, ModelStatus};

use rust_decimal::Decimal;
use std::str::FromStr;

/// Decimal columns round-trip through SQLite as TEXT (rusqlite can't host a
/// `ToSql`/`FromSql` impl for a foreign `Decimal` type without a newtype
/// wrapper, so call sites convert explicitly via these two helpers).
pub fn decimal_to_sql(d: &Decimal) -> String {
    d.to_string()
}

pub fn decimal_from_sql(s: &str) -> Result<Decimal, rusqlite::Error> {
    Decimal::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}
