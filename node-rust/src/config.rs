use clap::Parser;
use evonet_protocol::{
    ConfigError, NodeConfig, PeerAddr, SendFailurePolicy, Subnet, Timing, DEFAULT_SUBNET_ID,
};

#[derive(Parser, Debug)]
#[command(
    name = "evonet-node",
    about = "evonet fleet node: gossip membership and migrant exchange"
)]
pub struct Cli {
    /// Address peers reach this node at (ip or ip:port; port 0 picks one)
    #[arg(short = 'i', long, env = "EVONET_ADDR", default_value = "127.0.0.1:9000")]
    pub addr: String,

    /// Known peers (ip or ip:port), comma separated
    #[arg(short = 'n', long, env = "EVONET_SEEDS", value_delimiter = ',')]
    pub seeds: Vec<String>,

    /// Expected number of nodes in the whole fleet
    #[arg(short = 't', long, env = "EVONET_FLEET_SIZE", default_value = "100")]
    pub fleet_size: usize,

    /// Capacity of each message queue
    #[arg(short = 'm', long, default_value = "100")]
    pub max_msgs: usize,

    /// Subnet label for second-tier neighbour tracking
    #[arg(short = 's', long, env = "EVONET_SUBNET", default_value = DEFAULT_SUBNET_ID)]
    pub subnet: String,

    /// Track neighbours without a subnet tier
    #[arg(long, default_value = "false")]
    pub no_second_tier: bool,

    /// Serve a JSON status endpoint on this port
    #[arg(long, env = "EVONET_STATUS_PORT")]
    pub status_port: Option<u16>,

    /// Only timeouts, not refused or broken connections, mark peers bad
    #[arg(long, default_value = "false")]
    pub strict_send_failures: bool,
}

impl Cli {
    pub fn node_config(&self) -> Result<NodeConfig, ConfigError> {
        let seeds = self
            .seeds
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| PeerAddr::parse(s))
            .collect::<Result<Vec<_>, _>>()?;

        let subnet = if self.no_second_tier {
            Subnet::Flat
        } else {
            Subnet::Label(self.subnet.clone())
        };

        let send_failure_policy = if self.strict_send_failures {
            SendFailurePolicy::TimeoutOnly
        } else {
            SendFailurePolicy::AllErrors
        };

        let config = NodeConfig {
            addr: PeerAddr::parse(&self.addr)?,
            subnet,
            seeds,
            fleet_size_estimate: self.fleet_size,
            max_queue_depth: self.max_msgs,
            timing: Timing::default(),
            send_failure_policy,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["evonet-node"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&[]).node_config().unwrap();
        assert_eq!(cfg.node_id(), "127.0.0.1:9000");
        assert!(cfg.seeds.is_empty());
        assert_eq!(cfg.fleet_size_estimate, 100);
        assert_eq!(cfg.max_queue_depth, 100);
        assert_eq!(cfg.subnet, Subnet::Label(DEFAULT_SUBNET_ID.into()));
        assert_eq!(cfg.send_failure_policy, SendFailurePolicy::AllErrors);
    }

    #[test]
    fn test_full_command_line() {
        let cli = parse(&[
            "-i",
            "10.0.0.5:9100",
            "-n",
            "10.0.0.6,10.0.0.7:9200",
            "-t",
            "400",
            "-m",
            "50",
            "--no-second-tier",
            "--strict-send-failures",
            "--status-port",
            "8080",
        ]);
        assert_eq!(cli.status_port, Some(8080));
        let cfg = cli.node_config().unwrap();
        assert_eq!(cfg.node_id(), "10.0.0.5:9100");
        assert_eq!(
            cfg.seeds,
            vec![PeerAddr::new("10.0.0.6", 9000), PeerAddr::new("10.0.0.7", 9200)]
        );
        assert_eq!(cfg.fleet_size_estimate, 400);
        assert_eq!(cfg.max_queue_depth, 50);
        assert_eq!(cfg.subnet, Subnet::Flat);
        assert_eq!(cfg.send_failure_policy, SendFailurePolicy::TimeoutOnly);
    }

    #[test]
    fn test_bad_seed_fails_fast() {
        let err = parse(&["-n", "10.0.0.6:notaport"]).node_config().unwrap_err();
        assert!(matches!(err, ConfigError::BadPort(_)));

        let err = parse(&["-m", "0"]).node_config().unwrap_err();
        assert_eq!(err, ConfigError::ZeroQueueDepth);
    }
}
