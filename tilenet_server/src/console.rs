//! Operator console.
//!
//! Commands:
//!   status                               - server, world and player summary
//!   worlds                               - list hosted worlds
//!   tile <world> <x> <y> <layer> <id>    - set one tile
//!   flash <world> <x> <y> <layer> <id> <ms>
//!                                        - set one tile, restore it after <ms>
//!   quit                                 - handled by the binary

use std::time::Duration;

use tilenet_shared::tile::{Layer, Tile};

use crate::server::ServerShared;

fn parse<T: std::str::FromStr>(tok: Option<&&str>, what: &str) -> Result<T, String> {
    let tok = tok.ok_or_else(|| format!("missing {what}"))?;
    tok.parse().map_err(|_| format!("bad {what}: {tok}"))
}

fn parse_layer(tok: Option<&&str>) -> Result<Layer, String> {
    let raw: i32 = parse(tok, "layer")?;
    Layer::from_index(raw).ok_or_else(|| format!("bad layer: {raw}"))
}

impl ServerShared {
    /// Executes one console line and returns the lines to print.
    pub fn exec_console(&self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(cmd) = tokens.first() else {
            return Vec::new();
        };
        let result = match *cmd {
            "status" => Ok(self.status_lines()),
            "worlds" => Ok(self
                .worlds
                .all()
                .iter()
                .map(|h| {
                    let (w, hgt) = h.with_world(|w| (w.width(), w.height()));
                    format!(
                        "{} id={} {}x{} owner={} peers={}",
                        h.meta().name,
                        h.id().0,
                        w,
                        hgt,
                        h.meta().owner,
                        h.peer_count()
                    )
                })
                .collect()),
            "tile" => self.console_tile(&tokens[1..], None),
            "flash" => parse::<u64>(tokens.get(6), "duration")
                .and_then(|ms| self.console_tile(&tokens[1..6.min(tokens.len())], Some(ms))),
            other => Err(format!("Unknown command: {other}")),
        };
        result.unwrap_or_else(|e| vec![e])
    }

    fn status_lines(&self) -> Vec<String> {
        let mut out = vec![
            format!("Server: {}", self.cfg.server_name),
            format!("Tick: {}", self.tick()),
            format!("Worlds: {}", self.worlds.len()),
            format!("Players: {}", self.player_count()),
            format!("Extensions: {}", self.registry().names().join(", ")),
        ];
        for host in self.worlds.all() {
            out.push(format!(
                "  {}: peers={} pending_reversions={}",
                host.meta().name,
                host.peer_count(),
                host.pending_reversions()
            ));
        }
        out
    }

    fn console_tile(&self, args: &[&str], flash_ms: Option<u64>) -> Result<Vec<String>, String> {
        let name = args.first().ok_or("missing world")?;
        let host = self
            .worlds
            .get(name)
            .ok_or_else(|| format!("no world named {name}"))?;
        let x: i32 = parse(args.get(1), "x")?;
        let y: i32 = parse(args.get(2), "y")?;
        let layer = parse_layer(args.get(3))?;
        let tile = Tile(parse(args.get(4), "tile id")?);

        let old = match flash_ms {
            Some(ms) => host.place_temporary(x, y, layer, tile, Duration::from_millis(ms)),
            None => host.mutate(x, y, layer, tile),
        }
        .map_err(|e| e.to_string())?;
        Ok(vec![format!(
            "({x}, {y}) {layer:?}: {} -> {}",
            old.0, tile.0
        )])
    }
}
