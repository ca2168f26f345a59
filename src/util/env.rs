//! Environment configuration.
//!
//! Variables are read from the process environment (and `.env` through [`dotenvy`]) and
//! deserialized onto [`Env`] with a small serde deserializer, so field renames and defaults work
//! the same way they do for any other serde struct.

use std::iter::empty;
use std::sync::LazyLock;
use std::time::Duration;

use serde::Deserialize;
use serde::de::value::{MapDeserializer, SeqDeserializer};
use serde::de::{self, IntoDeserializer};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::engine::score::RankStep;

static ENV_VARS: LazyLock<OnceCell<Env>> = LazyLock::new(OnceCell::new);
pub async fn env() -> EnvResult<&'static Env> {
    ENV_VARS.get_or_try_init(|| async { Env::new() }).await
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Env {
    pub database_url: String,
    pub redis_url: String,
    pub internal_token: String,

    #[serde(default = "defaults::api_port")]
    pub server_api_port: u16,

    #[serde(default = "defaults::sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "defaults::sync_batch_size")]
    pub sync_batch_size: i64,
    #[serde(default = "defaults::sync_timeout_secs")]
    pub sync_timeout_secs: u64,
    #[serde(default = "defaults::sync_lease_secs")]
    pub sync_lease_secs: u64,
    #[serde(default = "defaults::store_timeout_ms")]
    pub store_timeout_ms: u64,

    #[serde(default = "defaults::weight_xp")]
    pub score_weight_xp: f64,
    #[serde(default = "defaults::weight_earnings")]
    pub score_weight_earnings: f64,
    #[serde(default = "defaults::weight_referrals")]
    pub score_weight_referrals: f64,
    #[serde(default = "defaults::weight_streak")]
    pub score_weight_streak: f64,

    #[serde(default = "defaults::cap_xp")]
    pub score_cap_xp: f64,
    #[serde(default = "defaults::cap_earnings")]
    pub score_cap_earnings: f64,
    #[serde(default = "defaults::cap_referrals")]
    pub score_cap_referrals: f64,
    #[serde(default = "defaults::cap_streak")]
    pub score_cap_streak: f64,

    /// Comma-separated `TIER:XP` ladder; empty keeps the default ladder.
    #[serde(default)]
    pub score_ranks: Vec<RankStep>,

    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
    #[serde(default = "defaults::service_name")]
    pub api_service_name: String,
    #[serde(default = "defaults::tracer_name")]
    pub api_tracer_name: String,
    #[serde(default = "defaults::log_filter")]
    pub log_filter: String,
}

mod defaults {
    pub const fn api_port() -> u16 {
        8080
    }
    pub const fn sync_interval_secs() -> u64 {
        300
    }
    pub const fn sync_batch_size() -> i64 {
        500
    }
    pub const fn sync_timeout_secs() -> u64 {
        120
    }
    pub const fn sync_lease_secs() -> u64 {
        180
    }
    pub const fn store_timeout_ms() -> u64 {
        2000
    }
    pub const fn weight_xp() -> f64 {
        0.4
    }
    pub const fn weight_earnings() -> f64 {
        0.3
    }
    pub const fn weight_referrals() -> f64 {
        0.2
    }
    pub const fn weight_streak() -> f64 {
        0.1
    }
    pub const fn cap_xp() -> f64 {
        50_000.0
    }
    pub const fn cap_earnings() -> f64 {
        10_000.0
    }
    pub const fn cap_referrals() -> f64 {
        100.0
    }
    pub const fn cap_streak() -> f64 {
        365.0
    }
    pub fn service_name() -> String {
        String::from("earnboard")
    }
    pub fn tracer_name() -> String {
        String::from("earnboard-tracer")
    }
    pub fn log_filter() -> String {
        String::from("earnboard=debug,tower_http=debug,axum=debug,sqlx=info,info")
    }
}

impl Env {
    pub fn new() -> EnvResult<Self> {
        Ok(from_env::<Env>()?)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

// ---
//  Deserializer implementation
// ---

struct Val(String, String);
struct Varname(String);

struct Vars<Iter: Iterator<Item = (String, String)>>(Iter);

impl<Iter: Iterator<Item = (String, String)>> Iterator for Vars<Iter> {
    type Item = (Varname, Val);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next().map(|(k, v)| (Varname(k.clone()), Val(k, v)))
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Val {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

impl<'de> IntoDeserializer<'de, EnvDeserializeError> for Varname {
    type Deserializer = Self;
    fn into_deserializer(self) -> Self::Deserializer {
        self
    }
}

macro_rules! forward_parsed_vals {
    ($($ty:ident => $method:ident,)*) => {
        $(
            fn $method<V>(self, visitor: V) -> Result<V::Value, EnvDeserializeError>
            where
                V: de::Visitor<'de>
            {
                match self.1.trim().parse::<$ty>() {
                    Ok(val) => val.into_deserializer().$method(visitor),
                    Err(e) => Err(de::Error::custom(format_args!(
                        "{}: while parsing '{}' (variable: {})",
                        e, self.1, self.0
                    ))),
                }
            }
        )*
    };
}

impl<'de> de::Deserializer<'de> for Val {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.1.into_deserializer().deserialize_any(visitor)
    }

    fn deserialize_seq<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.1.is_empty() {
            SeqDeserializer::new(empty::<Val>()).deserialize_seq(visitor)
        } else {
            let values = self
                .1
                .split(',')
                .map(|v| Val(self.0.clone(), v.trim().to_owned()));
            SeqDeserializer::new(values).deserialize_seq(visitor)
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        if self.1.trim().is_empty() {
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    forward_parsed_vals! {
        bool => deserialize_bool,
        u8 => deserialize_u8,
        u16 => deserialize_u16,
        u32 => deserialize_u32,
        u64 => deserialize_u64,
        i8 => deserialize_i8,
        i16 => deserialize_i16,
        i32 => deserialize_i32,
        i64 => deserialize_i64,
        f32 => deserialize_f32,
        f64 => deserialize_f64,
    }

    serde::forward_to_deserialize_any! {
        char str string unit bytes byte_buf map enum
        unit_struct tuple_struct identifier tuple
        ignored_any struct
    }
}

impl<'de> de::Deserializer<'de> for Varname {
    type Error = EnvDeserializeError;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: de::Visitor<'de>,
    {
        self.0.into_deserializer().deserialize_any(visitor)
    }

    serde::forward_to_deserialize_any! {
        char str string unit seq option bytes byte_buf map newtype_struct
        unit_struct tuple_struct identifier tuple ignored_any
        bool u8 u16 u32 u64 i8 i16 i32 i64 f32 f64 enum struct
    }
}

pub fn from_env<T>() -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
{
    from_iter(dotenvy::vars())
}

pub fn from_iter<Iter, T>(iter: Iter) -> Result<T, EnvDeserializeError>
where
    T: de::DeserializeOwned,
    Iter: IntoIterator<Item = (String, String)>,
{
    T::deserialize(MapDeserializer::<_, EnvDeserializeError>::new(Vars(iter.into_iter())))
}

impl de::Error for EnvDeserializeError {
    fn custom<T>(msg: T) -> Self
    where
        T: std::fmt::Display,
    {
        EnvDeserializeError::Custom(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        EnvDeserializeError::MissingValue(field.into())
    }
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error(transparent)]
    Dotenvy(#[from] dotenvy::Error),

    #[error(transparent)]
    DeserializationError(#[from] EnvDeserializeError),
}

#[derive(Debug, Error)]
pub enum EnvDeserializeError {
    #[error("env deserialization error: {0}")]
    Custom(String),

    #[error("missing environment variable: {0}")]
    MissingValue(String),
}
