//! Weather forecast demo handlers.

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier::{HandlerContext, MessageHandler};
use courier_core::Message;
use opentelemetry::KeyValue;
use opentelemetry::trace::TraceContextExt;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub const WEATHER_CREATED: &str = "weather_created";
pub const WEATHER_DELETED: &str = "weather_deleted";

pub const SUMMARIES: [&str; 10] = [
    "Freezing",
    "Bracing",
    "Chilly",
    "Cool",
    "Mild",
    "Warm",
    "Balmy",
    "Hot",
    "Sweltering",
    "Scorching",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherForecast {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<i32>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl WeatherForecast {
    /// Deterministic sample forecast for `index`.
    pub fn sample(index: u32) -> Self {
        Self {
            id: Some(Uuid::now_v7()),
            date: Some(Utc::now() + chrono::Duration::days(i64::from(index))),
            temperature_c: Some(-20 + (index as i32 * 7) % 55),
            summary: Some(SUMMARIES[index as usize % SUMMARIES.len()].to_string()),
        }
    }

    pub fn temperature_f(&self) -> Option<i32> {
        self.temperature_c
            .map(|c| 32 + (f64::from(c) / 0.5556).round() as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherDeletion {
    pub id: Uuid,
}

/// Handles forecasts published to the create topic.
pub struct WeatherCreated;

#[async_trait]
impl MessageHandler for WeatherCreated {
    fn event_type(&self) -> &str {
        WEATHER_CREATED
    }

    async fn handle(&self, message: &Message, cx: &HandlerContext) -> anyhow::Result<()> {
        let forecast: WeatherForecast =
            serde_json::from_slice(&message.payload).context("invalid weather forecast")?;

        let span = cx.otel_context().span();
        if let Some(summary) = &forecast.summary {
            span.set_attribute(KeyValue::new("weather.summary", summary.clone()));
        }
        if let Some(celsius) = forecast.temperature_c {
            span.set_attribute(KeyValue::new("weather.temperature_c", i64::from(celsius)));
        }
        cx.add_event("forecast accepted");

        info!(
            message_id = %message.id,
            summary = forecast.summary.as_deref().unwrap_or("-"),
            temperature_c = ?forecast.temperature_c,
            temperature_f = ?forecast.temperature_f(),
            attempt = cx.attempt(),
            "Weather forecast created"
        );
        Ok(())
    }
}

/// Handles deletions published to the delete topic.
pub struct WeatherDeleted;

#[async_trait]
impl MessageHandler for WeatherDeleted {
    fn event_type(&self) -> &str {
        WEATHER_DELETED
    }

    async fn handle(&self, message: &Message, cx: &HandlerContext) -> anyhow::Result<()> {
        let deletion: WeatherDeletion =
            serde_json::from_slice(&message.payload).context("invalid weather deletion")?;

        cx.otel_context()
            .span()
            .set_attribute(KeyValue::new("weather.id", deletion.id.to_string()));
        cx.add_event("forecast removed");

        info!(
            message_id = %message.id,
            forecast_id = %deletion.id,
            attempt = cx.attempt(),
            "Weather forecast deleted"
        );
        Ok(())
    }
}
