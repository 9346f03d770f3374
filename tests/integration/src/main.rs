mod helpers;

mod failover;
mod gossip;
mod migration;
mod server;
