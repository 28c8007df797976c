use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use super::{success, to_value};
use crate::auth::{self, PERM_SYSTEM_SETTINGS};
use crate::company::CompanyProfile;
use crate::messaging::MessagingConfig;
use crate::pricing::PricingConfig;
use crate::sync::SyncConfig;
use crate::{db, AppContext};

/// Categories never returned to callers.
const HIDDEN_CATEGORIES: &[&str] = &["staff"];

/// Overlay the fields present in `payload` on the current settings.
fn merged<T: Serialize + DeserializeOwned>(current: &T, payload: Value, what: &str) -> Result<T, String> {
    let Value::Object(incoming) = payload else {
        return Err(format!("Invalid {what} payload: expected an object"));
    };
    let mut document = to_value(current)?;
    if let Some(obj) = document.as_object_mut() {
        obj.extend(incoming);
    }
    serde_json::from_value(document).map_err(|e| format!("Invalid {what} payload: {e}"))
}

pub async fn settings_get_all(ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let mut all = db::get_all_settings(&conn);
    if let Some(obj) = all.as_object_mut() {
        for category in HIDDEN_CATEGORIES {
            obj.remove(*category);
        }
    }
    Ok(all)
}

pub async fn company_get(ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&CompanyProfile::load(&conn))
}

pub async fn company_save(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_SYSTEM_SETTINGS)?;
    let payload = arg0.ok_or("Missing company payload")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let profile = merged(&CompanyProfile::load(&conn), payload, "company")?;
    profile.save(&conn)?;
    info!(company = %profile.name, "Company profile saved");
    Ok(success(to_value(&profile)?))
}

pub async fn pricing_get_config(ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&PricingConfig::load(&conn))
}

pub async fn pricing_save_config(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_SYSTEM_SETTINGS)?;
    let payload = arg0.ok_or("Missing pricing payload")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let config = merged(&PricingConfig::load(&conn), payload, "pricing")?;
    config.save(&conn)?;
    info!(
        seasons = config.high_season_periods.len(),
        surcharge = config.high_season_surcharge,
        "Pricing config saved"
    );
    Ok(success(to_value(&config)?))
}

pub async fn messaging_get_config(ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&MessagingConfig::load(&conn))
}

pub async fn messaging_save_config(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_SYSTEM_SETTINGS)?;
    let payload = arg0.ok_or("Missing messaging payload")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let config = merged(&MessagingConfig::load(&conn), payload, "messaging")?;
    config.save(&conn)?;
    Ok(success(to_value(&MessagingConfig::load(&conn))?))
}

pub async fn sync_get_config(ctx: &AppContext) -> Result<Value, String> {
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    to_value(&SyncConfig::load(&conn))
}

/// The running loop picks the new interval up on its next wake.
pub async fn sync_save_config(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::require_permission(&ctx.db, &ctx.auth, PERM_SYSTEM_SETTINGS)?;
    let payload = arg0.ok_or("Missing sync config payload")?;
    let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
    let config = merged(&SyncConfig::load(&conn), payload, "sync config")?;
    config.save(&conn)?;
    info!(
        enabled = config.enabled,
        interval_secs = config.interval_secs,
        "Sync config saved"
    );
    Ok(success(to_value(&config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::test_ctx;
    use serde_json::json;

    #[tokio::test]
    async fn company_save_merges_partial_updates() {
        let (ctx, _dir) = test_ctx();
        company_save(Some(json!({ "name": "Bali Wheels", "paymentTermsDays": 7 })), &ctx)
            .await
            .unwrap();
        company_save(Some(json!({ "phone": "0361 123 456" })), &ctx)
            .await
            .unwrap();
        let profile = company_get(&ctx).await.unwrap();
        assert_eq!(profile["name"], "Bali Wheels");
        assert_eq!(profile["paymentTermsDays"], 7);
        assert_eq!(profile["phone"], "0361 123 456");
    }

    #[tokio::test]
    async fn invalid_values_are_rejected() {
        let (ctx, _dir) = test_ctx();
        let err = pricing_save_config(Some(json!({ "overtimeThresholdHours": 30.0 })), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, "Overtime threshold must be between 0 and 24 hours");
        let err = sync_save_config(Some(json!({ "intervalSecs": 1 })), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, "Sync interval must be between 5 seconds and 24 hours");
        assert!(company_save(Some(json!("x")), &ctx).await.is_err());
    }

    #[tokio::test]
    async fn pricing_seasons_round_trip_through_settings() {
        let (ctx, _dir) = test_ctx();
        pricing_save_config(
            Some(json!({
                "highSeasonSurcharge": 50000.0,
                "highSeasonPeriods": [{ "label": "Lebaran", "start": "2026-03-15", "end": "2026-03-25" }]
            })),
            &ctx,
        )
        .await
        .unwrap();
        let config = pricing_get_config(&ctx).await.unwrap();
        assert_eq!(config["highSeasonSurcharge"], 50000.0);
        assert_eq!(config["highSeasonPeriods"][0]["label"], "Lebaran");
    }

    #[tokio::test]
    async fn staff_pins_are_not_listed() {
        let (ctx, _dir) = test_ctx();
        {
            let conn = ctx.db.conn.lock().unwrap();
            db::set_setting(&conn, "staff", "admin_pin_hash", "$2b$12$x").unwrap();
            db::set_setting(&conn, "company", "name", "Bali Wheels").unwrap();
        }
        let all = settings_get_all(&ctx).await.unwrap();
        assert!(all.get("staff").is_none());
        assert_eq!(all["company"]["name"], "Bali Wheels");
    }
}
