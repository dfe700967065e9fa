//! Exercises the driver against a live server.
//!
//! Configuration comes from the usual environment variables: `PGHOST`,
//! `PGPORT`, `PGUSER`, `PGPASSWORD`, `PGDATABASE`, plus `PGSSL=true` to
//! require TLS.
use std::env;

use pglink::{Config, Connection, Credential, LogLevel, Pool, PoolConfig, Value};

fn config_from_env() -> Config {
    Config {
        host: env::var("PGHOST").unwrap_or_else(|_| "localhost".into()),
        port: env::var("PGPORT").ok().and_then(|p| p.parse().ok()).unwrap_or(5432),
        ssl: env::var("PGSSL").is_ok_and(|v| v == "true"),
        user: env::var("PGUSER").unwrap_or_else(|_| "postgres".into()),
        database: env::var("PGDATABASE").unwrap_or_else(|_| "postgres".into()),
        credential: match env::var("PGPASSWORD") {
            Ok(password) => Credential::ScramSha256 { password },
            Err(_) => Credential::Trust,
        },
        ..Config::default()
    }
}

fn main() -> pglink::Result<()> {
    pglink::logger::global().set_level(LogLevel::Fine);
    let config = config_from_env();

    let conn = Connection::connect(&config)?;
    println!("connected as {}", conn.id());

    let stmt = conn.prepare("SELECT version(), $1")?;
    for row in stmt.execute(&[Value::from("hello from pglink")])? {
        println!("{:?}", row?);
    }

    conn.begin_transaction()?;
    println!("transaction status: {:?}", conn.transaction_status());
    conn.rollback_transaction()?;
    conn.close();

    let pool = Pool::new(PoolConfig::default(), config);
    for _ in 0..3 {
        let conn = pool.acquire()?;
        let stmt = conn.prepare("SELECT now()::text")?;
        for row in stmt.execute(&[])? {
            println!("{} says {:?}", conn.id(), row?);
        }
    }
    println!("{}", pool.compute_metrics(false));
    pool.close(false);

    Ok(())
}
