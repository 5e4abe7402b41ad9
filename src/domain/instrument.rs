//! Instrument identity as stored in the instrument table.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instrument {
    pub id: i64,
    pub symbol: String,
    pub company_name: String,
}

impl Instrument {
    pub fn new(id: i64, symbol: &str, company_name: &str) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            company_name: company_name.to_string(),
        }
    }
}
