use crate::error::BotError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;

pub mod creator;

/// Grid bot configuration, loaded from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GridConfig {
    /// Trading pair in exchange notation (e.g. "ADAUSDT").
    pub symbol: String,
    pub lower_price: f64,
    pub upper_price: f64,
    /// Number of grid steps; the grid has grid_count + 1 levels.
    pub grid_count: u32,
    /// Base-asset quantity per level order.
    pub quantity: f64,
    /// Maximum total investment in quote asset; gates compensating orders.
    pub max_investment: f64,
    /// Stop-loss threshold as a percentage below the initial price.
    pub stop_loss_pct: f64,
    /// Directory for the persisted state file.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default)]
    pub paper: PaperConfig,
}

/// Seed values for the paper-trading adapter.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PaperConfig {
    #[serde(default = "default_quote_balance")]
    pub quote_balance: f64,
    #[serde(default = "default_base_balance")]
    pub base_balance: f64,
    /// Starting price; defaults to the midpoint of the grid range.
    #[serde(default)]
    pub start_price: Option<f64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            quote_balance: default_quote_balance(),
            base_balance: default_base_balance(),
            start_price: None,
        }
    }
}

fn default_state_dir() -> String {
    ".".to_string()
}

fn default_quote_balance() -> f64 {
    1000.0
}

fn default_base_balance() -> f64 {
    1000.0
}

impl GridConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.upper_price <= self.lower_price {
            return Err(anyhow::anyhow!(
                "Upper price {} must be greater than lower price {}.",
                self.upper_price,
                self.lower_price
            ));
        }
        if self.grid_count < 1 {
            return Err(anyhow::anyhow!(
                "Grid count {} must be at least 1.",
                self.grid_count
            ));
        }
        if self.quantity <= 0.0 {
            return Err(anyhow::anyhow!("Quantity must be positive."));
        }
        if self.max_investment <= 0.0 {
            return Err(anyhow::anyhow!("Max investment must be positive."));
        }
        if self.stop_loss_pct <= 0.0 || self.stop_loss_pct >= 100.0 {
            return Err(anyhow::anyhow!(
                "Stop loss percentage {} must be between 0 and 100.",
                self.stop_loss_pct
            ));
        }
        if self.symbol.len() < 5 {
            return Err(anyhow::anyhow!(
                "Symbol '{}' is not a valid pair symbol.",
                self.symbol
            ));
        }
        Ok(())
    }

    /// Base asset of the pair ("ADA" for "ADAUSDT").
    pub fn base_asset(&self) -> &str {
        if let Some(base) = self.symbol.strip_suffix("USDT") {
            base
        } else {
            &self.symbol[..self.symbol.len() - 4]
        }
    }

    /// Quote asset of the pair ("USDT" for "ADAUSDT").
    pub fn quote_asset(&self) -> &str {
        if self.symbol.ends_with("USDT") {
            "USDT"
        } else {
            &self.symbol[self.symbol.len() - 4..]
        }
    }

    pub fn grid_size(&self) -> f64 {
        (self.upper_price - self.lower_price) / self.grid_count as f64
    }
}

pub fn load_config(path: &str) -> Result<GridConfig, BotError> {
    let content = fs::read_to_string(path)?;
    let mut config: GridConfig = toml::from_str(&content)?;
    apply_env_overrides(&mut config);
    config
        .validate()
        .map_err(|e| BotError::ValidationError(e.to_string()))?;
    Ok(config)
}

/// Environment overrides, read after `.env` has been loaded by the caller.
fn apply_env_overrides(config: &mut GridConfig) {
    if let Ok(dir) = env::var("GRID_BOT_STATE_DIR") {
        config.state_dir = dir;
    }
    if let Ok(symbol) = env::var("GRID_BOT_SYMBOL") {
        config.symbol = symbol;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> GridConfig {
        GridConfig {
            symbol: "ADAUSDT".to_string(),
            lower_price: 0.785,
            upper_price: 0.815,
            grid_count: 3,
            quantity: 13.0,
            max_investment: 27.0,
            stop_loss_pct: 5.0,
            state_dir: ".".to_string(),
            paper: PaperConfig::default(),
        }
    }

    #[test]
    fn test_validation_upper_less_than_lower() {
        let mut config = valid_config();
        config.lower_price = 0.9;
        let res = config.validate();
        assert!(res.is_err());
        assert_eq!(
            res.unwrap_err().to_string(),
            "Upper price 0.815 must be greater than lower price 0.9."
        );
    }

    #[test]
    fn test_validation_grid_count_zero() {
        let mut config = valid_config();
        config.grid_count = 0;
        let res = config.validate();
        assert!(res.is_err());
        assert_eq!(
            res.unwrap_err().to_string(),
            "Grid count 0 must be at least 1."
        );
    }

    #[test]
    fn test_validation_negative_quantity() {
        let mut config = valid_config();
        config.quantity = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_stop_loss_bounds() {
        let mut config = valid_config();
        config.stop_loss_pct = 0.0;
        assert!(config.validate().is_err());
        config.stop_loss_pct = 100.0;
        assert!(config.validate().is_err());
        config.stop_loss_pct = 5.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_asset_split() {
        let config = valid_config();
        assert_eq!(config.base_asset(), "ADA");
        assert_eq!(config.quote_asset(), "USDT");
    }

    #[test]
    fn test_grid_size() {
        let config = valid_config();
        assert!((config.grid_size() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn test_parse_toml_with_defaults() {
        let toml_str = r#"
            symbol = "ADAUSDT"
            lower_price = 0.785
            upper_price = 0.815
            grid_count = 3
            quantity = 13.0
            max_investment = 27.0
            stop_loss_pct = 5.0
        "#;
        let config: GridConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.state_dir, ".");
        assert_eq!(config.paper.quote_balance, 1000.0);
        assert!(config.paper.start_price.is_none());
        assert!(config.validate().is_ok());
    }
}
