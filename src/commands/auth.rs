use serde_json::Value;

use crate::{auth, AppContext};

pub async fn auth_login(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::login(arg0, &ctx.db, &ctx.auth)
}

pub async fn auth_logout(ctx: &AppContext) -> Result<Value, String> {
    auth::logout(&ctx.auth);
    Ok(serde_json::json!({ "success": true }))
}

/// Current session, `null` when logged out, plus whether PINs are set up.
pub async fn auth_session(ctx: &AppContext) -> Result<Value, String> {
    let configured = {
        let conn = ctx.db.conn.lock().map_err(|e| e.to_string())?;
        auth::pins_configured(&conn)
    };
    Ok(serde_json::json!({
        "session": auth::get_session_json(&ctx.auth),
        "pinsConfigured": configured,
    }))
}

pub async fn auth_setup_pin(arg0: Option<Value>, ctx: &AppContext) -> Result<Value, String> {
    auth::setup_pin(arg0, &ctx.db, &ctx.auth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::master_data::customer_delete;
    use crate::commands::tests::test_ctx;
    use serde_json::json;

    #[tokio::test]
    async fn staff_sessions_cannot_delete_master_data() {
        let (ctx, _dir) = test_ctx();
        auth_setup_pin(Some(json!({ "adminPin": "1234", "staffPin": "5678" })), &ctx)
            .await
            .unwrap();
        let err = customer_delete(Some(json!("cus-1")), &ctx).await.unwrap_err();
        assert_eq!(err, "Login required");

        auth_login(Some(json!("5678")), &ctx).await.unwrap();
        let session = auth_session(&ctx).await.unwrap();
        assert_eq!(session["session"]["role"], "staff");
        assert_eq!(session["pinsConfigured"], true);
        let err = customer_delete(Some(json!("cus-1")), &ctx).await.unwrap_err();
        assert_eq!(err, "Permission denied: staff cannot delete master data");

        auth_logout(&ctx).await.unwrap();
        auth_login(Some(json!({ "pin": "1234" })), &ctx).await.unwrap();
        let err = customer_delete(Some(json!("cus-1")), &ctx).await.unwrap_err();
        assert_eq!(err, "Customer not found: cus-1");
    }
}
