use std::fmt::Write;
use std::time::Duration;

use crate::server::Snapshot;

/// Namespace prefix for all exported metrics.
const NS: &str = "craftnap";

/// Render the Prometheus text exposition payload.
pub fn render(snapshots: &[Snapshot], uptime: Duration) -> String {
    let mut out = String::new();

    let _ = writeln!(
        out,
        "# HELP {NS}_uptime_seconds Time since the service started"
    );
    let _ = writeln!(out, "# TYPE {NS}_uptime_seconds gauge");
    let _ = writeln!(out, "{NS}_uptime_seconds {:.1}", uptime.as_secs_f64());
    out.push('\n');

    let _ = writeln!(out, "# HELP {NS}_server_state Current server state (1=active)");
    let _ = writeln!(out, "# TYPE {NS}_server_state gauge");
    for snap in snapshots {
        let _ = writeln!(
            out,
            "{NS}_server_state{{server=\"{}\",state=\"{}\"}} 1",
            snap.name,
            snap.state.as_str()
        );
    }
    out.push('\n');

    let _ = writeln!(out, "# HELP {NS}_players_online Current online player count");
    let _ = writeln!(out, "# TYPE {NS}_players_online gauge");
    for snap in snapshots {
        let _ = writeln!(
            out,
            "{NS}_players_online{{server=\"{}\"}} {}",
            snap.name, snap.players_online
        );
    }
    out.push('\n');

    let _ = writeln!(out, "# HELP {NS}_players_max Max player slots");
    let _ = writeln!(out, "# TYPE {NS}_players_max gauge");
    for snap in snapshots {
        let _ = writeln!(
            out,
            "{NS}_players_max{{server=\"{}\"}} {}",
            snap.name, snap.players_max
        );
    }
    out.push('\n');

    let _ = writeln!(
        out,
        "# HELP {NS}_idle_seconds Seconds the server has been idle (0 if not idle)"
    );
    let _ = writeln!(out, "# TYPE {NS}_idle_seconds gauge");
    for snap in snapshots {
        let _ = writeln!(
            out,
            "{NS}_idle_seconds{{server=\"{}\"}} {}",
            snap.name, snap.idle_seconds
        );
    }
    out.push('\n');

    let _ = writeln!(out, "# HELP {NS}_starts_total Total times this server was started");
    let _ = writeln!(out, "# TYPE {NS}_starts_total counter");
    for snap in snapshots {
        let _ = writeln!(
            out,
            "{NS}_starts_total{{server=\"{}\"}} {}",
            snap.name, snap.start_count
        );
    }
    out.push('\n');

    let _ = writeln!(out, "# HELP {NS}_stops_total Total times this server was stopped");
    let _ = writeln!(out, "# TYPE {NS}_stops_total counter");
    for snap in snapshots {
        let _ = writeln!(
            out,
            "{NS}_stops_total{{server=\"{}\"}} {}",
            snap.name, snap.stop_count
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Edition;
    use crate::state::State;

    fn snapshot(name: &str) -> Snapshot {
        Snapshot {
            name: name.into(),
            state: State::Idle,
            port: 25565,
            edition: Edition::Java,
            players_online: 2,
            players_max: 20,
            version: "1.21.4".into(),
            idle_seconds: 17,
            start_count: 3,
            stop_count: 4,
        }
    }

    #[test]
    fn renders_all_metric_families() {
        let out = render(&[snapshot("survival")], Duration::from_secs(90));

        assert!(out.contains("# TYPE craftnap_uptime_seconds gauge"));
        assert!(out.contains("craftnap_uptime_seconds 90.0"));
        assert!(out.contains("craftnap_server_state{server=\"survival\",state=\"IDLE\"} 1"));
        assert!(out.contains("craftnap_players_online{server=\"survival\"} 2"));
        assert!(out.contains("craftnap_players_max{server=\"survival\"} 20"));
        assert!(out.contains("craftnap_idle_seconds{server=\"survival\"} 17"));
        assert!(out.contains("# TYPE craftnap_starts_total counter"));
        assert!(out.contains("craftnap_starts_total{server=\"survival\"} 3"));
        assert!(out.contains("craftnap_stops_total{server=\"survival\"} 4"));
    }

    #[test]
    fn renders_one_line_per_server() {
        let out = render(&[snapshot("a"), snapshot("b")], Duration::ZERO);
        assert_eq!(out.matches("craftnap_players_online{").count(), 2);
    }
}
