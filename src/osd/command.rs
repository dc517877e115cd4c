//! Administrative commands.
//!
//! Commands arrive as whitespace-split tokens and are answered with a
//! [`CommandReply`] carrying an errno-style code (0 on success) and text
//! output, JSON for the dump commands.

use super::queues::CommandItem;
use super::Osd;
use crate::network::messages::{CommandReply, CommandRequest};
use crate::network::{Destination, Message};
use crate::types::{Epoch, PgId};
use serde::Serialize;

const ENOENT: i32 = -2;
const EIO: i32 = -5;
const EINVAL: i32 = -22;
const ETIMEDOUT: i32 = -110;

fn json<T: Serialize>(value: &T) -> (i32, String) {
    match serde_json::to_string_pretty(value) {
        Ok(out) => (0, out),
        Err(e) => (EIO, format!("failed to encode output: {}", e)),
    }
}

impl Osd {
    pub(super) fn process_command(&self, item: CommandItem) {
        let reply = self.handle_command(&item.req);
        self.send(Destination::Conn(item.conn), Message::CommandReply(reply));
    }

    /// Run one command and build its reply.
    pub fn handle_command(&self, req: &CommandRequest) -> CommandReply {
        let tokens: Vec<&str> = req.tokens.iter().map(String::as_str).collect();
        tracing::info!(tid = req.tid, command = ?tokens, "admin command");
        let (code, output) = match tokens.as_slice() {
            ["status"] => (0, self.status_text()),
            ["dump_ops_in_flight"] => json(&self.op_tracker.dump()),
            ["flush_pg_stats"] => self.flush_pg_stats_command(),
            ["dump_osdmap"] => self.dump_osdmap(None),
            ["dump_osdmap", epoch] => match epoch.parse::<Epoch>() {
                Ok(epoch) => self.dump_osdmap(Some(epoch)),
                Err(_) => (EINVAL, format!("bad epoch '{}'", epoch)),
            },
            ["pg", pgid, rest @ ..] => match pgid.parse::<PgId>() {
                Ok(pgid) => self.pg_command(pgid, rest),
                Err(_) => (EINVAL, format!("bad pgid '{}'", pgid)),
            },
            _ => (EINVAL, format!("unknown command '{}'", tokens.join(" "))),
        };
        if code != 0 {
            tracing::debug!(tid = req.tid, code, output, "command failed");
        }
        CommandReply {
            tid: req.tid,
            code,
            output,
        }
    }

    fn status_text(&self) -> String {
        format!(
            "osd.{} state {:?} epoch {} pgs {} ops_in_flight {}\n{}",
            self.whoami,
            self.state(),
            self.epoch(),
            self.registry.len(),
            self.op_tracker.len(),
            self.metrics.to_prometheus()
        )
    }

    fn flush_pg_stats_command(&self) -> (i32, String) {
        for pg in self.registry.all() {
            if pg.lock().is_primary() {
                self.queue_stats(&pg);
            }
        }
        self.send_pg_stats();
        if self
            .reporter
            .flush_pg_stats(self.config.report.mon_ack_timeout)
        {
            (0, String::new())
        } else {
            (ETIMEDOUT, "timed out waiting for stats acks".to_string())
        }
    }

    fn dump_osdmap(&self, epoch: Option<Epoch>) -> (i32, String) {
        let map = match epoch {
            None => self.osdmap(),
            Some(epoch) => match self.get_map(epoch) {
                Ok(map) => map,
                Err(e) => return (ENOENT, e.to_string()),
            },
        };
        json(map.as_ref())
    }

    fn pg_command(&self, pgid: PgId, args: &[&str]) -> (i32, String) {
        let Some(mut pg) = self.registry.lookup_locked(pgid) else {
            return (ENOENT, format!("pg {} not found", pgid));
        };
        match args {
            ["query"] => json(&serde_json::json!({
                "pgid": pgid.to_string(),
                "state": pg.state_string(),
                "epoch": pg.epoch,
                "role": pg.role.to_string(),
                "up": pg.up,
                "acting": pg.acting,
                "info": pg.info,
                "log_entries": pg.log.len(),
                "missing": pg.missing.len(),
                "queued_ops": pg.op_queue.len(),
            })),
            ["scrub"] => {
                if !pg.is_primary() {
                    return (EINVAL, format!("not primary for pg {}", pgid));
                }
                pg.scrub.must_scrub = true;
                (0, format!("instructing pg {} to scrub", pgid))
            }
            ["trim_log", keep] => {
                let Ok(keep) = keep.parse::<usize>() else {
                    return (EINVAL, format!("bad length '{}'", keep));
                };
                let saved = (pg.info.clone(), pg.log.clone());
                let dropped = pg.log.trim_to_len(keep);
                if dropped == 0 {
                    return (0, "trimmed 0 log entries".to_string());
                }
                pg.info.log_tail = pg.log.tail();
                if let Err(e) = self.commit_meta(&pg) {
                    tracing::error!(pgid = %pgid, error = %e, "log trim failed to commit");
                    let (info, log) = saved;
                    pg.info = info;
                    pg.log = log;
                    return (EIO, e.to_string());
                }
                (0, format!("trimmed {} log entries", dropped))
            }
            _ => (EINVAL, format!("unknown pg command '{}'", args.join(" "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OsdConfig;
    use crate::network::messages::OpKind;
    use crate::testing::{active_node, create_pg, submit_op, MapBuilder};
    use bytes::Bytes;

    fn command(osd: &Osd, line: &str) -> CommandReply {
        osd.handle_command(&CommandRequest {
            tid: 1,
            tokens: line.split_whitespace().map(String::from).collect(),
            payload: Bytes::new(),
        })
    }

    #[test]
    fn test_status_and_unknown() {
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        let (osd, _, _) = active_node(OsdConfig::new(0), &map);

        let reply = command(&osd, "status");
        assert_eq!(reply.code, 0);
        assert!(reply.output.starts_with("osd.0 state Active epoch 1"));
        assert!(reply.output.contains("osd_ops_received_total"));

        assert_eq!(command(&osd, "frobnicate").code, EINVAL);
        assert_eq!(command(&osd, "pg zz query").code, EINVAL);
        assert_eq!(command(&osd, "pg 1.3 query").code, ENOENT);
        assert_eq!(command(&osd, "dump_osdmap 40").code, ENOENT);
    }

    #[test]
    fn test_pg_query_and_trim_log() {
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        let (osd, _, _) = active_node(OsdConfig::new(0), &map);
        let pgid = PgId::new(1, 1);
        create_pg(&osd, pgid);
        for i in 0..5 {
            submit_op(&osd, 1, pgid, &format!("obj{}", i), OpKind::Write {
                data: Bytes::from_static(b"data"),
            });
        }

        let reply = command(&osd, "pg 1.1 query");
        assert_eq!(reply.code, 0);
        let value: serde_json::Value = serde_json::from_str(&reply.output).unwrap();
        assert_eq!(value["state"], "active");
        assert_eq!(value["log_entries"], 5);

        let reply = command(&osd, "pg 1.1 trim_log 2");
        assert_eq!(reply.code, 0);
        assert_eq!(reply.output, "trimmed 3 log entries");
        let pg = osd.registry().lookup(pgid).unwrap();
        assert_eq!(pg.lock().log.len(), 2);
    }

    #[test]
    fn test_trim_log_commit_failure_keeps_log() {
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        let (osd, store, _) = active_node(OsdConfig::new(0), &map);
        let pgid = PgId::new(1, 0);
        create_pg(&osd, pgid);
        for i in 0..5 {
            submit_op(&osd, 1, pgid, &format!("obj{}", i), OpKind::Write {
                data: Bytes::from_static(b"data"),
            });
        }
        let tail = osd.registry().lookup(pgid).unwrap().lock().info.log_tail;

        store.fail_next_commits(1);
        let reply = command(&osd, "pg 1.0 trim_log 2");
        assert_eq!(reply.code, EIO);
        assert!(reply.output.contains("injected failure"), "{}", reply.output);

        let pg = osd.registry().lookup(pgid).unwrap();
        let state = pg.lock();
        assert_eq!(state.log.len(), 5);
        assert_eq!(state.info.log_tail, tail);
    }

    #[test]
    fn test_pg_scrub_sets_flag() {
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        let (osd, _, _) = active_node(OsdConfig::new(0), &map);
        let pgid = PgId::new(1, 2);
        create_pg(&osd, pgid);

        assert_eq!(command(&osd, "pg 1.2 scrub").code, 0);
        assert!(osd.registry().lookup(pgid).unwrap().lock().scrub.must_scrub);
    }

    #[test]
    fn test_flush_without_pending_stats() {
        let map = MapBuilder::new(1).pool(1, 4, 1).build();
        let (osd, _, _) = active_node(OsdConfig::new(0), &map);
        assert_eq!(command(&osd, "flush_pg_stats").code, 0);
        let reply = command(&osd, "dump_ops_in_flight");
        assert_eq!(reply.code, 0);
        assert_eq!(reply.output, "[]");
    }
}
