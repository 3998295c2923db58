//! Channel set: one transport per channel, picked once per step.

use std::sync::Arc;

use notarydrip_core::config::{DripConfig, EmailProvider, SmsProvider};
use notarydrip_core::traits::Transport;
use notarydrip_core::types::Channel;

use crate::email::{HttpEmailTransport, SmtpEmailTransport};
use crate::log::LogTransport;
use crate::sms::HttpSmsTransport;

/// The email and SMS transports the dispatcher delivers through.
#[derive(Clone)]
pub struct ChannelSet {
    email: Arc<dyn Transport>,
    sms: Arc<dyn Transport>,
}

impl ChannelSet {
    pub fn new(email: Arc<dyn Transport>, sms: Arc<dyn Transport>) -> Self {
        Self { email, sms }
    }

    /// Dry-run transports on both channels.
    pub fn logging() -> Self {
        Self::new(
            Arc::new(LogTransport::new(Channel::Email)),
            Arc::new(LogTransport::new(Channel::Sms)),
        )
    }

    /// Build transports from config.
    pub fn from_config(config: &DripConfig) -> Self {
        let email: Arc<dyn Transport> = match config.email.provider {
            EmailProvider::Sendgrid => Arc::new(HttpEmailTransport::new(&config.email)),
            EmailProvider::Smtp => Arc::new(SmtpEmailTransport::new(&config.email)),
            EmailProvider::Log => Arc::new(LogTransport::new(Channel::Email)),
        };
        let sms: Arc<dyn Transport> = match config.sms.provider {
            SmsProvider::Twilio => Arc::new(HttpSmsTransport::new(&config.sms)),
            SmsProvider::Log => Arc::new(LogTransport::new(Channel::Sms)),
        };
        tracing::info!("📡 Transports: email={}, sms={}", email.name(), sms.name());
        Self { email, sms }
    }

    /// The transport for a channel.
    pub fn select(&self, channel: Channel) -> Arc<dyn Transport> {
        match channel {
            Channel::Email => self.email.clone(),
            Channel::Sms => self.sms.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_picks_providers() {
        let mut cfg = DripConfig::default();
        cfg.email.provider = EmailProvider::Sendgrid;
        let set = ChannelSet::from_config(&cfg);
        assert_eq!(set.select(Channel::Email).name(), "sendgrid");
        assert_eq!(set.select(Channel::Sms).name(), "log");
        assert_eq!(set.select(Channel::Sms).channel(), Channel::Sms);
    }
}
