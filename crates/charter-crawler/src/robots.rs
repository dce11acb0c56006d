use std::collections::HashMap;
use std::sync::Mutex;

use texting_robots::Robot;

use crate::fetch::Fetcher;

// Token matched against robots.txt user-agent groups; sites without a
// group for it fall back to "*".
const ROBOTS_AGENT: &str = "charter-crawl";

/// Lazily fetched, process-lifetime robots.txt verdicts per origin.
/// Missing or unreadable robots.txt means the site is assumed open.
pub(crate) struct RobotsGate {
    cache: Mutex<HashMap<String, Option<Robot>>>,
}

impl RobotsGate {
    pub(crate) fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn allows<F: Fetcher>(&self, fetcher: &F, url: &str) -> bool {
        let Some(origin) = origin_of(url) else {
            return true;
        };

        {
            let cache = self.cache.lock().unwrap();
            if let Some(robot) = cache.get(&origin) {
                return robot.as_ref().map_or(true, |r| r.allowed(url));
            }
        }

        let robot = match fetcher.fetch_robots(&origin).await {
            Some(body) => Robot::new(ROBOTS_AGENT, body.as_bytes()).ok(),
            None => None,
        };
        let allowed = robot.as_ref().map_or(true, |r| r.allowed(url));
        // A concurrent first check may have raced us here; either entry
        // was parsed from the same document.
        self.cache.lock().unwrap().insert(origin, robot);
        allowed
    }
}

fn origin_of(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let port = parsed.port().map(|p| format!(":{p}")).unwrap_or_default();
    Some(format!("{}://{host}{port}", parsed.scheme()))
}
