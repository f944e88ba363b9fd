use crate::config::Config;

/// One configured S0 input together with its optional reporting identity.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Ordinal position, stable for the process lifetime.
    pub index: usize,

    /// GPIO pin number (sysfs numbering).
    pub gpio: u32,

    /// Middleware UUID, if this channel is mapped on the remote side.
    pub uuid: Option<String>,
}

/// Ordered set of channels, built once from configuration.
#[derive(Debug)]
pub struct Registry {
    channels: Vec<Channel>,
}

impl Registry {
    /// Build the registry from configuration, preserving config order.
    pub fn from_config(cfg: &Config) -> Self {
        let channels = cfg
            .channels
            .iter()
            .enumerate()
            .map(|(index, ch)| Channel {
                index,
                gpio: ch.gpio,
                uuid: ch.uuid.clone(),
            })
            .collect();

        Self { channels }
    }

    /// Number of configured channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channels are configured.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterate channels in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    /// Look up a channel by index.
    pub fn get(&self, index: usize) -> Option<&Channel> {
        self.channels.get(index)
    }

    /// Middleware UUID for a channel, if it has one.
    pub fn uuid(&self, index: usize) -> Option<&str> {
        self.channels.get(index).and_then(|c| c.uuid.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;

    fn config_with_channels(channels: Vec<ChannelConfig>) -> Config {
        Config {
            channels,
            ..Config::default()
        }
    }

    #[test]
    fn test_indexes_follow_config_order() {
        let cfg = config_with_channels(vec![
            ChannelConfig {
                gpio: 23,
                uuid: Some("water".to_string()),
            },
            ChannelConfig {
                gpio: 17,
                uuid: None,
            },
        ]);

        let registry = Registry::from_config(&cfg);
        assert_eq!(registry.len(), 2);

        let channels: Vec<&Channel> = registry.iter().collect();
        assert_eq!(channels[0].index, 0);
        assert_eq!(channels[0].gpio, 23);
        assert_eq!(channels[1].index, 1);
        assert_eq!(channels[1].gpio, 17);
    }

    #[test]
    fn test_uuid_lookup() {
        let cfg = config_with_channels(vec![
            ChannelConfig {
                gpio: 17,
                uuid: Some("electricity".to_string()),
            },
            ChannelConfig {
                gpio: 18,
                uuid: None,
            },
        ]);

        let registry = Registry::from_config(&cfg);
        assert_eq!(registry.uuid(0), Some("electricity"));
        assert_eq!(registry.uuid(1), None);
        assert_eq!(registry.uuid(7), None);
    }

    #[test]
    fn test_get_out_of_range() {
        let cfg = config_with_channels(vec![ChannelConfig {
            gpio: 17,
            uuid: None,
        }]);

        let registry = Registry::from_config(&cfg);
        assert!(registry.get(0).is_some());
        assert!(registry.get(1).is_none());
    }
}
