pub mod trade_audit;
