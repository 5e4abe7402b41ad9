//! Field registry.
//!
//! The allow-list of condition field names and where each one lives. Both the
//! SQL compiler and the evaluators resolve fields only through here, so a name
//! that is not registered can never reach a query.

use crate::domain::error::ScreenwatchError;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Number,
    String,
    Boolean,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// One current value per instrument.
    Snapshot,
    /// One value per period per instrument.
    TimeSeries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub table: String,
    pub column: String,
    pub alias: String,
    pub value_type: ValueType,
    pub cardinality: Cardinality,
}

impl FieldSpec {
    pub fn snapshot(name: &str, table: &str, alias: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            column: name.to_string(),
            alias: alias.to_string(),
            value_type,
            cardinality: Cardinality::Snapshot,
        }
    }

    pub fn time_series(name: &str, table: &str, alias: &str) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            column: name.to_string(),
            alias: alias.to_string(),
            value_type: ValueType::Number,
            cardinality: Cardinality::TimeSeries,
        }
    }

    pub fn with_column(mut self, column: &str) -> Self {
        self.column = column.to_string();
        self
    }

    pub fn is_time_series(&self) -> bool {
        self.cardinality == Cardinality::TimeSeries
    }

    /// `alias.column`, as referenced from the screen query.
    pub fn qualified_column(&self) -> String {
        format!("{}.{}", self.alias, self.column)
    }
}

/// Physical layout shared by every registered table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLayout {
    pub instrument_table: String,
    pub instrument_alias: String,
    pub instrument_key: String,
    /// Column on metric tables that references `instrument_key`.
    pub foreign_key: String,
    /// Ordering columns of time-series tables, most significant first.
    pub period_columns: Vec<String>,
}

impl Default for SchemaLayout {
    fn default() -> Self {
        Self {
            instrument_table: "stocks_master".into(),
            instrument_alias: "s".into(),
            instrument_key: "id".into(),
            foreign_key: "stock_id".into(),
            period_columns: vec!["year".into(), "quarter".into()],
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldRegistry {
    layout: SchemaLayout,
    fields: BTreeMap<String, FieldSpec>,
}

pub struct FieldRegistryBuilder {
    layout: SchemaLayout,
    fields: Vec<FieldSpec>,
}

impl FieldRegistryBuilder {
    pub fn field(mut self, spec: FieldSpec) -> Self {
        self.fields.push(spec);
        self
    }

    pub fn build(self) -> Result<FieldRegistry, ScreenwatchError> {
        let layout_idents = [
            &self.layout.instrument_table,
            &self.layout.instrument_alias,
            &self.layout.instrument_key,
            &self.layout.foreign_key,
        ];
        for ident in layout_idents.into_iter().chain(self.layout.period_columns.iter()) {
            check_identifier("layout", ident)?;
        }

        let mut fields = BTreeMap::new();
        let mut aliases: BTreeMap<String, String> = BTreeMap::new();
        for spec in self.fields {
            for ident in [&spec.name, &spec.table, &spec.column, &spec.alias] {
                check_identifier(&spec.name, ident)?;
            }
            if spec.alias == self.layout.instrument_alias && spec.table != self.layout.instrument_table {
                return Err(registry_error(&spec.name, "alias collides with the instrument table alias"));
            }
            if let Some(table) = aliases.get(&spec.alias) {
                if *table != spec.table {
                    return Err(registry_error(
                        &spec.name,
                        &format!("alias '{}' already used by table '{}'", spec.alias, table),
                    ));
                }
            }
            if spec.is_time_series() && spec.table == self.layout.instrument_table {
                return Err(registry_error(&spec.name, "instrument table cannot hold time-series fields"));
            }
            aliases.insert(spec.alias.clone(), spec.table.clone());
            let name = spec.name.clone();
            if fields.insert(name.clone(), spec).is_some() {
                return Err(registry_error(&name, "duplicate field name"));
            }
        }

        Ok(FieldRegistry {
            layout: self.layout,
            fields,
        })
    }
}

fn registry_error(key: &str, reason: &str) -> ScreenwatchError {
    ScreenwatchError::ConfigInvalid {
        section: "registry".into(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn check_identifier(key: &str, ident: &str) -> Result<(), ScreenwatchError> {
    let mut chars = ident.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(registry_error(key, &format!("'{ident}' is not a plain identifier")))
    }
}

static GLOBAL: OnceLock<FieldRegistry> = OnceLock::new();

impl FieldRegistry {
    pub fn builder(layout: SchemaLayout) -> FieldRegistryBuilder {
        FieldRegistryBuilder {
            layout,
            fields: Vec::new(),
        }
    }

    /// The deployment schema: instruments, fundamentals, quarterly financials
    /// and analyst targets.
    pub fn builtin() -> Self {
        use ValueType::{Number, String};

        let mut builder = Self::builder(SchemaLayout::default());
        for name in ["symbol", "company_name", "sector", "exchange"] {
            builder = builder.field(FieldSpec::snapshot(name, "stocks_master", "s", String));
        }
        for name in ["pe_ratio", "peg_ratio", "debt", "free_cash_flow"] {
            builder = builder.field(FieldSpec::snapshot(name, "fundamentals", "f", Number));
        }
        for name in ["revenue", "ebitda", "net_profit"] {
            builder = builder.field(FieldSpec::time_series(name, "quarterly_financials", "q"));
        }
        for name in ["target_price_low", "target_price_high", "current_market_price"] {
            builder = builder.field(FieldSpec::snapshot(name, "analyst_targets", "a", Number));
        }
        match builder.build() {
            Ok(registry) => registry,
            Err(e) => unreachable!("builtin registry is well-formed: {e}"),
        }
    }

    /// Process-wide registry, initialised on first use and read-only after.
    pub fn global() -> &'static FieldRegistry {
        GLOBAL.get_or_init(Self::builtin)
    }

    pub fn layout(&self) -> &SchemaLayout {
        &self.layout
    }

    /// Look up a field. A dotted name (`fundamentals.pe_ratio`) resolves to its
    /// last segment when the prefix names that field's table.
    pub fn get(&self, name: &str) -> Option<&FieldSpec> {
        match name.rsplit_once('.') {
            Some((table, field)) => self.fields.get(field).filter(|spec| spec.table == table),
            None => self.fields.get(name),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
