use crate::config::{GridConfig, PaperConfig};
use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input};
use std::fs;

pub fn create_config() -> Result<()> {
    let theme = ColorfulTheme::default();

    let symbol: String = Input::with_theme(&theme)
        .with_prompt("Symbol (e.g., ADAUSDT)")
        .default("ADAUSDT".to_string())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.len() >= 5 {
                Ok(())
            } else {
                Err("Symbol must be a pair symbol like ADAUSDT")
            }
        })
        .interact_text()?;

    let lower_price: f64 = Input::with_theme(&theme)
        .with_prompt("Lower Price")
        .interact_text()?;

    let upper_price: f64 = Input::with_theme(&theme)
        .with_prompt("Upper Price")
        .validate_with(|input: &f64| -> Result<(), &str> {
            if *input > lower_price {
                Ok(())
            } else {
                Err("Upper price must be greater than lower price")
            }
        })
        .interact_text()?;

    let grid_count: u32 = Input::with_theme(&theme)
        .with_prompt("Grid Count")
        .validate_with(|input: &u32| -> Result<(), &str> {
            if *input >= 1 {
                Ok(())
            } else {
                Err("Grid count must be at least 1")
            }
        })
        .interact_text()?;

    let quantity: f64 = Input::with_theme(&theme)
        .with_prompt("Quantity per Level (base asset)")
        .default(13.0)
        .interact_text()?;

    let max_investment: f64 = Input::with_theme(&theme)
        .with_prompt("Max Investment (quote asset)")
        .default(27.0)
        .interact_text()?;

    let stop_loss_pct: f64 = Input::with_theme(&theme)
        .with_prompt("Stop Loss %")
        .default(5.0)
        .interact_text()?;

    let customize_paper = Confirm::with_theme(&theme)
        .with_prompt("Customize paper-trading balances?")
        .default(false)
        .interact()?;

    let paper = if customize_paper {
        let quote_balance: f64 = Input::with_theme(&theme)
            .with_prompt("Paper quote balance")
            .default(1000.0)
            .interact_text()?;
        let base_balance: f64 = Input::with_theme(&theme)
            .with_prompt("Paper base balance")
            .default(1000.0)
            .interact_text()?;
        PaperConfig {
            quote_balance,
            base_balance,
            start_price: None,
        }
    } else {
        PaperConfig::default()
    };

    let config = GridConfig {
        symbol,
        lower_price,
        upper_price,
        grid_count,
        quantity,
        max_investment,
        stop_loss_pct,
        state_dir: ".".to_string(),
        paper,
    };
    config.validate()?;

    let default_filename = format!(
        "{}_grid_{}_{}.toml",
        config.symbol, config.lower_price, config.upper_price
    );

    let filename: String = Input::with_theme(&theme)
        .with_prompt("Configuration filename")
        .default(default_filename)
        .interact_text()?;

    let toml_string = toml::to_string_pretty(&config)?;

    let path = if filename.ends_with(".toml") {
        filename
    } else {
        format!("{}.toml", filename)
    };

    let final_path = if !path.contains('/') && fs::metadata("configs").is_ok() {
        format!("configs/{}", path)
    } else {
        path
    };

    fs::write(&final_path, toml_string)?;
    println!("Configuration saved to {}", final_path);

    Ok(())
}
