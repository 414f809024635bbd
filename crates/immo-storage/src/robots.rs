//! robots.txt rules for one crawler identity, backed by `texting_robots`.

use std::fmt;
use std::time::Duration;

use texting_robots::Robot;
use tracing::warn;

/// Rules that apply to our user agent on one host. A missing or unparsable
/// file allows everything.
pub struct RobotsTxt {
    robot: Option<Robot>,
}

impl RobotsTxt {
    pub fn allow_all() -> Self {
        Self { robot: None }
    }

    pub fn parse(user_agent: &str, content: &str) -> Self {
        match Robot::new(agent_token(user_agent), content.as_bytes()) {
            Ok(robot) => Self { robot: Some(robot) },
            Err(err) => {
                warn!(error = %err, "unparsable robots.txt, allowing all");
                Self::allow_all()
            }
        }
    }

    /// `path` is the path plus query of the URL being checked.
    pub fn is_allowed(&self, path: &str) -> bool {
        self.robot.as_ref().map_or(true, |robot| robot.allowed(path))
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.robot
            .as_ref()
            .and_then(|robot| robot.delay)
            .filter(|delay| delay.is_finite() && *delay >= 0.0)
            .map(Duration::from_secs_f32)
    }
}

impl Default for RobotsTxt {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl fmt::Debug for RobotsTxt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RobotsTxt")
            .field("has_rules", &self.robot.is_some())
            .field("crawl_delay", &self.crawl_delay())
            .finish()
    }
}

/// Product token matched against `User-agent` lines: `immo-crawler/0.1` -> `immo-crawler`.
fn agent_token(user_agent: &str) -> &str {
    user_agent
        .split(|c: char| c == '/' || c.is_whitespace())
        .find(|part| !part.is_empty())
        .unwrap_or("*")
}
