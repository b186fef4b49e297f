//! The simulation clock: traffic, links and node timers advanced together.

use std::time::Duration;

use meridian_core::config::MeridianConfig;
use meridian_core::SimTime;

use crate::report::SimulationReport;
use crate::topology::{Topology, TopologyError};
use crate::traffic::{Traffic, TrafficError};

/// Resolution at which frames move across links.
const STEP: Duration = Duration::from_millis(1);

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Traffic(#[from] TrafficError),
}

#[derive(Debug)]
pub struct Simulation {
    topology: Topology,
    traffic: Traffic,
    now: SimTime,
    tick: Duration,
    until: Option<SimTime>,
}

impl Simulation {
    pub fn new(config: &MeridianConfig) -> Result<Self, SimulationError> {
        let mut topology = Topology::build(config)?;
        let traffic = Traffic::build(&config.traffic, &mut topology)?;
        let duration = config.simulation.duration_secs;
        Ok(Self {
            topology,
            traffic,
            now: SimTime::ZERO,
            tick: Duration::from_millis(config.simulation.tick_millis.max(1)),
            until: (duration > 0).then(|| Duration::from_secs(duration)),
        })
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    pub fn is_done(&self) -> bool {
        self.until.is_some_and(|until| self.now >= until)
    }

    /// Advance by one tick: fire due traffic and move frames at each step,
    /// then run the node timers once.
    pub fn advance(&mut self) -> Result<(), SimulationError> {
        let end = self.now + self.tick;
        let end = self.until.map_or(end, |until| end.min(until));
        while self.now < end {
            self.traffic.fire(&mut self.topology, self.now)?;
            self.topology.step(self.now)?;
            self.now += STEP;
        }
        self.topology.step(self.now)?;
        self.topology.tick(self.now)?;
        tracing::debug!(now_ms = self.now.as_millis() as u64, "tick");
        Ok(())
    }

    /// Stop every node and collect the final statistics.
    pub fn finish(mut self, interrupted: bool) -> SimulationReport {
        let reports = self.topology.node_reports();
        self.topology.stop();
        SimulationReport {
            simulated_millis: self.now.as_millis() as u64,
            interrupted,
            nodes: reports,
            links: self.topology.link_reports(),
            flows: self.traffic.stats(),
        }
    }

    /// Advance once per `interval` tick until the configured duration.
    pub async fn run(&mut self) -> Result<(), SimulationError> {
        let mut interval = tokio::time::interval(self.tick);
        while !self.is_done() {
            interval.tick().await;
            self.advance()?;
        }
        tracing::info!(now_ms = self.now.as_millis() as u64, "simulation complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> MeridianConfig {
        let mut config = MeridianConfig::default();
        config.simulation.duration_secs = 3;
        config.simulation.tick_millis = 100;
        config.red.enabled = false;
        config
    }

    #[test]
    fn default_run_delivers_both_families() {
        let mut sim = Simulation::new(&quick_config()).unwrap();
        while !sim.is_done() {
            sim.advance().unwrap();
        }
        assert_eq!(sim.now(), Duration::from_secs(3));
        let report = sim.finish(false);

        let host_b = report.nodes.iter().find(|n| n.name == "host-b").unwrap();
        // Three v4 datagrams at 0, 1 and 2 seconds. The v6 flow waits for
        // duplicate address detection before its first datagram leaves.
        assert!(host_b.node.datagrams_delivered >= 4, "{:?}", host_b.node);
        assert!(report.flows.iter().all(|f| f.sent == 3));
        assert!(report.links.iter().all(|l| l.stats.corrupted == 0));
    }

    #[test]
    fn report_is_json() {
        let mut sim = Simulation::new(&quick_config()).unwrap();
        sim.advance().unwrap();
        let report = sim.finish(true);
        let v = serde_json::to_value(&report).unwrap();
        assert_eq!(v["simulated_millis"], 100);
        assert_eq!(v["interrupted"], true);
        assert_eq!(v["nodes"].as_array().unwrap().len(), 3);
        assert_eq!(v["links"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_stops_at_the_configured_duration() {
        let mut config = quick_config();
        config.simulation.duration_secs = 1;
        let mut sim = Simulation::new(&config).unwrap();
        sim.run().await.unwrap();
        assert_eq!(sim.now(), Duration::from_secs(1));
    }
}
