//! Provider payloads published to the push bus.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::job::{DRY_RUN_KEY, Job, Service};
use crate::user::User;

const FAKE_PREFIX: &str = "FAKE-";
const APNS_FAKE_TOKEN_LEN: usize = 64;
const GCM_FAKE_TOKEN_LEN: usize = 152;

/// Topic for an app/service pair: each `%s` in `template` is replaced in turn
/// by the app name and the service.
pub fn topic_for(template: &str, app_name: &str, service: Service) -> String {
    let mut args = [app_name, service.as_str()].into_iter();
    let mut out = String::with_capacity(template.len() + app_name.len());
    let mut rest = template;
    while let Some(pos) = rest.find("%s") {
        out.push_str(&rest[..pos]);
        out.push_str(args.next().unwrap_or_default());
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

/// Synthetic device token of `len` characters used for dry runs.
pub fn fake_token<R: Rng + ?Sized>(len: usize, rng: &mut R) -> String {
    let body: String = (0..len.saturating_sub(FAKE_PREFIX.len()))
        .map(|_| char::from(rng.sample(Alphanumeric)))
        .collect();
    format!("{FAKE_PREFIX}{body}")
}

/// Per-message metadata attached to every push.
pub fn push_metadata(job: &Job, user: &User, template_name: &str, now: DateTime<Utc>) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("userId".into(), json!(user.user_id));
    meta.insert("pushTime".into(), json!(now.timestamp()));
    meta.insert("templateName".into(), json!(template_name));
    meta.insert("jobId".into(), json!(job.id.to_string()));
    meta.insert("pushType".into(), json!("massive"));
    meta.insert("muid".into(), json!(Uuid::new_v4().to_string()));
    if let Some(dry_run) = job.dry_run() {
        meta.insert(DRY_RUN_KEY.into(), json!(dry_run));
    }
    meta
}

/// Build the provider-specific push for one user.
pub fn build_push<R: Rng + ?Sized>(
    job: &Job,
    user: &User,
    template_name: &str,
    message: Map<String, Value>,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Value {
    let meta = push_metadata(job, user, template_name, now);
    let push_expiry = job.expires_at / 1_000_000_000;
    let dry_run = job.dry_run().unwrap_or(false);

    match job.service {
        Service::Apns => {
            let token = if dry_run {
                fake_token(APNS_FAKE_TOKEN_LEN, rng)
            } else {
                user.token.clone()
            };
            json!({
                "DeviceToken": token,
                "Payload": { "aps": message, "m": job.metadata },
                "push_expiry": push_expiry,
                "metadata": meta,
            })
        }
        Service::Gcm => {
            let mut data = message;
            if !job.metadata.is_empty() {
                data.insert("m".into(), Value::Object(job.metadata.clone()));
            }
            let mut push = json!({
                "to": user.token,
                "data": data,
                "push_expiry": push_expiry,
                "metadata": meta,
            });
            if dry_run {
                push["to"] = json!(fake_token(GCM_FAKE_TOKEN_LEN, rng));
                push["dry_run"] = json!(true);
            }
            push
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::AppId;

    fn job(service: Service) -> Job {
        let mut job = Job::new(AppId::new(), "game", service, "welcome");
        job.expires_at = 5_000_000_000;
        job.metadata.insert("campaign".into(), json!("c1"));
        job
    }

    fn message() -> Map<String, Value> {
        json!({"alert": "hi"}).as_object().cloned().unwrap()
    }

    #[test]
    fn topic_replaces_app_then_service() {
        assert_eq!(topic_for("push-%s_%s", "game", Service::Gcm), "push-game_gcm");
        assert_eq!(topic_for("static", "game", Service::Gcm), "static");
    }

    #[test]
    fn apns_shape() {
        let user = User::new("u1", "real-token");
        let push = build_push(&job(Service::Apns), &user, "welcome", message(), Utc::now(), &mut rand::thread_rng());

        assert_eq!(push["DeviceToken"], "real-token");
        assert_eq!(push["Payload"]["aps"]["alert"], "hi");
        assert_eq!(push["Payload"]["m"]["campaign"], "c1");
        assert_eq!(push["push_expiry"], 5);
        assert_eq!(push["metadata"]["userId"], "u1");
        assert_eq!(push["metadata"]["pushType"], "massive");
        assert!(push["metadata"].get("dryRun").is_none());
    }

    #[test]
    fn gcm_shape() {
        let user = User::new("u1", "real-token");
        let push = build_push(&job(Service::Gcm), &user, "welcome", message(), Utc::now(), &mut rand::thread_rng());

        assert_eq!(push["to"], "real-token");
        assert_eq!(push["data"]["alert"], "hi");
        assert_eq!(push["data"]["m"]["campaign"], "c1");
        assert!(push.get("dry_run").is_none());
    }

    #[test]
    fn dry_run_replaces_token() {
        let mut j = job(Service::Gcm);
        j.metadata.insert(DRY_RUN_KEY.into(), json!(true));
        let user = User::new("u1", "real-token");
        let push = build_push(&j, &user, "welcome", message(), Utc::now(), &mut rand::thread_rng());

        let to = push["to"].as_str().unwrap();
        assert!(to.starts_with("FAKE-"));
        assert_eq!(to.len(), GCM_FAKE_TOKEN_LEN);
        assert_eq!(push["dry_run"], true);
        assert_eq!(push["metadata"]["dryRun"], true);

        j.service = Service::Apns;
        let push = build_push(&j, &user, "welcome", message(), Utc::now(), &mut rand::thread_rng());
        assert_eq!(push["DeviceToken"].as_str().unwrap().len(), APNS_FAKE_TOKEN_LEN);
    }

    #[test]
    fn muid_is_fresh_per_message() {
        let j = job(Service::Apns);
        let user = User::new("u1", "t");
        let a = push_metadata(&j, &user, "welcome", Utc::now());
        let b = push_metadata(&j, &user, "welcome", Utc::now());
        assert_ne!(a["muid"], b["muid"]);
    }
}
