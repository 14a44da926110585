//! Built-in source schemas.
//!
//! Each [`DatasetSchema`] names where the key comes from, which numeric
//! fields are accumulated (with their validity bounds), and which fields are
//! derived once aggregation is complete.

use crate::config::{ColumnMapping, ColumnRef};
use crate::key::{BLOCK_GROUP_WIDTH, KeyMode};
use crate::pipeline::ratio::DerivedField;

/// Header of the key column in every output file.
pub const KEY_COLUMN: &str = "county_fips";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum DatasetKind {
    /// Census population microdata (sex counts by subgroup)
    Census,
    /// Social-distancing device counts by census block group
    Mobility,
    /// Self-reported general health status (1-5) by county
    Health,
    /// COVID-19 deaths by sex and county
    Deaths,
}

impl DatasetKind {
    pub const ALL: [DatasetKind; 4] = [
        DatasetKind::Census,
        DatasetKind::Mobility,
        DatasetKind::Health,
        DatasetKind::Deaths,
    ];
}

/// Where a record's geographic identifier comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Single(&'static str),
    StateCounty {
        state: &'static str,
        county: &'static str,
    },
}

impl KeySource {
    pub fn fields(&self) -> Vec<&'static str> {
        match self {
            KeySource::Single(field) => vec![*field],
            KeySource::StateCounty { state, county } => vec![*state, *county],
        }
    }
}

/// A numeric field with optional inclusive bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl FieldSpec {
    pub fn count(name: &'static str) -> Self {
        Self {
            name,
            min: Some(0.0),
            max: None,
        }
    }

    pub fn bounded(name: &'static str, min: f64, max: f64) -> Self {
        Self {
            name,
            min: Some(min),
            max: Some(max),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetSchema {
    pub kind: DatasetKind,
    pub name: &'static str,
    pub key: KeySource,
    pub fields: Vec<FieldSpec>,
    pub derived: Vec<DerivedField>,
    pub default_mode: KeyMode,
    pub default_source_width: Option<usize>,
    pub default_source: &'static str,
    pub default_output: &'static str,
    default_columns: Vec<(&'static str, ColumnRef)>,
}

impl DatasetSchema {
    pub fn for_kind(kind: DatasetKind) -> Self {
        match kind {
            DatasetKind::Census => Self::census(),
            DatasetKind::Mobility => Self::mobility(),
            DatasetKind::Health => Self::health(),
            DatasetKind::Deaths => Self::deaths(),
        }
    }

    /// Census population estimates: one row per county subgroup.
    pub fn census() -> Self {
        Self {
            kind: DatasetKind::Census,
            name: "census",
            key: KeySource::StateCounty {
                state: "state",
                county: "county",
            },
            fields: vec![FieldSpec::count("males"), FieldSpec::count("females")],
            derived: vec![DerivedField::share("prop_male", "males", "females")],
            default_mode: KeyMode::Pad,
            default_source_width: None,
            default_source: "census-2018-pop.csv",
            default_output: "census_gender_by_county.csv",
            default_columns: vec![
                ("state", ColumnRef::Index(1)),
                ("county", ColumnRef::Index(2)),
                ("males", ColumnRef::Index(8)),
                ("females", ColumnRef::Index(9)),
            ],
        }
    }

    /// Social-distancing metrics keyed by 12-digit block group.
    pub fn mobility() -> Self {
        Self {
            kind: DatasetKind::Mobility,
            name: "mobility",
            key: KeySource::Single("origin_census_block_group"),
            fields: vec![
                FieldSpec::count("device_count"),
                FieldSpec::count("completely_home_device_count"),
            ],
            derived: vec![DerivedField::fraction(
                "proportion_stayed_at_home",
                "completely_home_device_count",
                "device_count",
            )],
            default_mode: KeyMode::Truncate,
            default_source_width: Some(BLOCK_GROUP_WIDTH),
            default_source: "safegraph/{date}-social-distancing.csv",
            default_output: "safegraph_aggregated_{date}_by_county.csv",
            default_columns: vec![
                (
                    "origin_census_block_group",
                    ColumnRef::Name("origin_census_block_group".into()),
                ),
                ("device_count", ColumnRef::Name("device_count".into())),
                (
                    "completely_home_device_count",
                    ColumnRef::Name("completely_home_device_count".into()),
                ),
            ],
        }
    }

    /// Survey responses; general health is coded 1 (excellent) to 5 (poor).
    pub fn health() -> Self {
        Self {
            kind: DatasetKind::Health,
            name: "health",
            key: KeySource::Single("county_fips"),
            fields: vec![FieldSpec::bounded("general_health", 1.0, 5.0)],
            derived: vec![DerivedField::mean("mean_health_status", "general_health")],
            default_mode: KeyMode::Pad,
            default_source_width: None,
            default_source: "health-survey.csv",
            default_output: "health_by_county.csv",
            default_columns: vec![
                ("county_fips", ColumnRef::Name("county_fips".into())),
                ("general_health", ColumnRef::Name("general_health".into())),
            ],
        }
    }

    /// COVID-19 deaths by sex. Zero deaths derive a missing proportion.
    pub fn deaths() -> Self {
        Self {
            kind: DatasetKind::Deaths,
            name: "deaths",
            key: KeySource::Single("county_fips"),
            fields: vec![
                FieldSpec::count("male_deaths"),
                FieldSpec::count("female_deaths"),
            ],
            derived: vec![DerivedField::share(
                "proportion_male_deaths",
                "male_deaths",
                "female_deaths",
            )],
            default_mode: KeyMode::Pad,
            default_source_width: None,
            default_source: "covid-deaths-by-sex.csv",
            default_output: "covid_deaths_gender_by_county.csv",
            default_columns: vec![
                ("county_fips", ColumnRef::Name("county_fips".into())),
                ("male_deaths", ColumnRef::Name("male_deaths".into())),
                ("female_deaths", ColumnRef::Name("female_deaths".into())),
            ],
        }
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.to_string()).collect()
    }

    pub fn default_columns(&self) -> ColumnMapping {
        self.default_columns
            .iter()
            .map(|(field, column)| (field.to_string(), column.clone()))
            .collect()
    }

    /// Output header: key column then derived fields.
    pub fn output_header(&self) -> Vec<String> {
        std::iter::once(KEY_COLUMN.to_string())
            .chain(self.derived.iter().map(|d| d.name.clone()))
            .collect()
    }
}
