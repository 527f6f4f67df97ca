use hashbrown::HashMap;
use tracing::info;

/// Where a hint directs the statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintTarget {
    Master,
    Slave,
    Server(String),
}

/// One decoded `maxscale` comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintVerb {
    /// `route to <target>`: applies to this statement only.
    RouteTo(HintTarget),
    /// `<name> prepare route to <target>`: defined, not yet active.
    Prepare(String, HintTarget),
    /// `begin route to <target>` / `<name> begin [route to <target>]`:
    /// activates a block hint until a matching `end`.
    Begin {
        name: Option<String>,
        target: Option<HintTarget>,
    },
    End,
}

/// Per-session store of prepared hints and the active block-hint stack.
#[derive(Debug, Default)]
pub struct HintRegistry {
    prepared: HashMap<String, HintTarget>,
    stack: Vec<HintTarget>,
}

impl HintRegistry {
    /// Currently active block hint, if any.
    pub fn active(&self) -> Option<&HintTarget> {
        self.stack.last()
    }

    fn apply(&mut self, verb: HintVerb) -> Option<HintTarget> {
        match verb {
            HintVerb::RouteTo(t) => return Some(t),
            HintVerb::Prepare(name, t) => {
                self.prepared.insert(name, t);
            }
            HintVerb::Begin { name, target } => match (name, target) {
                (Some(name), Some(t)) => {
                    // shorthand form defines and activates in one go
                    self.prepared.insert(name, t.clone());
                    self.stack.push(t);
                }
                (Some(name), None) => match self.prepared.get(&name) {
                    Some(t) => self.stack.push(t.clone()),
                    None => info!("ignoring hint: no prepared hint named {name:?}"),
                },
                (None, Some(t)) => self.stack.push(t),
                (None, None) => info!("ignoring hint: begin without a route target or name"),
            },
            HintVerb::End => {
                if self.stack.pop().is_none() {
                    info!("ignoring hint: end without an open hint block");
                }
            }
        }
        None
    }
}

/// Extract the contents of every comment in the statement text, in order:
/// `-- ...` (to end of line), `# ...` (to end of line), `/* ... */`.
pub fn extract_comments(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    let mut in_string: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = in_string {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == q {
                in_string = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => {
                in_string = Some(b);
                i += 1;
            }
            b'#' => {
                let end = sql[i + 1..]
                    .find('\n')
                    .map(|p| i + 1 + p)
                    .unwrap_or(sql.len());
                out.push(&sql[i + 1..end]);
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && matches!(bytes.get(i + 2), None | Some(b' ') | Some(b'\t')) =>
            {
                let end = sql[i + 2..]
                    .find('\n')
                    .map(|p| i + 2 + p)
                    .unwrap_or(sql.len());
                out.push(&sql[i + 2..end]);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                match sql[i + 2..].find("*/") {
                    Some(p) => {
                        out.push(&sql[i + 2..i + 2 + p]);
                        i = i + 2 + p + 2;
                    }
                    None => {
                        out.push(&sql[i + 2..]);
                        i = sql.len();
                    }
                }
            }
            _ => i += 1,
        }
    }
    out
}

fn parse_target<'a, I: Iterator<Item = &'a str>>(words: &mut I) -> Option<HintTarget> {
    match words.next()?.to_ascii_lowercase().as_str() {
        "master" => Some(HintTarget::Master),
        "slave" => Some(HintTarget::Slave),
        "server" => words.next().map(|n| HintTarget::Server(n.to_string())),
        _ => None,
    }
}

/// Decode one comment. Returns `None` both for comments that are not
/// maxscale hints and for malformed hints; the latter are logged at INFO and
/// otherwise ignored, never an error.
pub fn parse_hint(comment: &str) -> Option<HintVerb> {
    let mut words = comment.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("maxscale") {
        return None;
    }
    let second = words.next()?;
    let lowered = second.to_ascii_lowercase();

    let verb = match lowered.as_str() {
        "route" => {
            if !words.next().is_some_and(|w| w.eq_ignore_ascii_case("to")) {
                info!("ignoring malformed hint {comment:?}: route without to");
                return None;
            }
            match parse_target(&mut words) {
                Some(t) => HintVerb::RouteTo(t),
                None => {
                    info!("ignoring malformed hint {comment:?}: bad route target");
                    return None;
                }
            }
        }
        "begin" => HintVerb::Begin {
            name: None,
            target: parse_begin_target(comment, &mut words)?,
        },
        "end" => HintVerb::End,
        _ => {
            // named form: <name> prepare|begin ...
            let name = second.to_string();
            match words.next().map(|w| w.to_ascii_lowercase()) {
                Some(v) if v == "prepare" => {
                    if !words.next().is_some_and(|w| w.eq_ignore_ascii_case("route"))
                        || !words.next().is_some_and(|w| w.eq_ignore_ascii_case("to"))
                    {
                        info!("ignoring malformed hint {comment:?}: prepare without route to");
                        return None;
                    }
                    match parse_target(&mut words) {
                        Some(t) => HintVerb::Prepare(name, t),
                        None => {
                            info!("ignoring malformed hint {comment:?}: bad prepare target");
                            return None;
                        }
                    }
                }
                Some(v) if v == "begin" => HintVerb::Begin {
                    name: Some(name),
                    target: parse_begin_target(comment, &mut words)?,
                },
                _ => {
                    info!("ignoring malformed hint {comment:?}: unknown verb");
                    return None;
                }
            }
        }
    };
    Some(verb)
}

/// Optional `route to <target>` suffix of a `begin`.
fn parse_begin_target<'a, I: Iterator<Item = &'a str>>(
    comment: &str,
    words: &mut I,
) -> Option<Option<HintTarget>> {
    match words.next() {
        None => Some(None),
        Some(w) if w.eq_ignore_ascii_case("route") => {
            if !words.next().is_some_and(|x| x.eq_ignore_ascii_case("to")) {
                info!("ignoring malformed hint {comment:?}: route without to");
                return None;
            }
            match parse_target(words) {
                Some(t) => Some(Some(t)),
                None => {
                    info!("ignoring malformed hint {comment:?}: bad route target");
                    None
                }
            }
        }
        Some(_) => {
            info!("ignoring malformed hint {comment:?}: trailing tokens after begin");
            None
        }
    }
}

/// Process all hint comments of one statement against the session registry.
/// The returned target is the route override for this statement: a one-shot
/// hint wins, otherwise the innermost active block hint applies.
pub fn hint_for_statement(sql: &str, registry: &mut HintRegistry) -> Option<HintTarget> {
    let mut one_shot = None;
    for comment in extract_comments(sql) {
        if let Some(verb) = parse_hint(comment) {
            if let Some(t) = registry.apply(verb) {
                one_shot = Some(t);
            }
        }
    }
    one_shot.or_else(|| registry.active().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(sql: &str, reg: &mut HintRegistry) -> Option<HintTarget> {
        hint_for_statement(sql, reg)
    }

    #[test]
    fn dash_dash_route_to_server() {
        let mut reg = HintRegistry::default();
        let t = route(
            "select @@server_id; -- maxscale route to server server3",
            &mut reg,
        );
        assert_eq!(t, Some(HintTarget::Server("server3".to_string())));
        // one-shot: the next statement is unhinted
        assert_eq!(route("select 1", &mut reg), None);
    }

    #[test]
    fn hash_and_block_comment_forms() {
        let mut reg = HintRegistry::default();
        assert_eq!(
            route("select 1 # maxscale route to master", &mut reg),
            Some(HintTarget::Master)
        );
        assert_eq!(
            route("select 1 /* maxscale route to slave */", &mut reg),
            Some(HintTarget::Slave)
        );
    }

    #[test]
    fn begin_end_block() {
        let mut reg = HintRegistry::default();
        assert_eq!(
            route("select 1; -- maxscale begin route to master", &mut reg),
            Some(HintTarget::Master)
        );
        // block stays active
        assert_eq!(route("select 2", &mut reg), Some(HintTarget::Master));
        // a one-shot overrides without closing the block
        assert_eq!(
            route("select 3 -- maxscale route to server s3", &mut reg),
            Some(HintTarget::Server("s3".to_string()))
        );
        assert_eq!(route("select 4", &mut reg), Some(HintTarget::Master));
        assert_eq!(route("select 5 -- maxscale end", &mut reg), None);
        assert_eq!(route("select 6", &mut reg), None);
    }

    #[test]
    fn named_prepare_then_begin() {
        let mut reg = HintRegistry::default();
        // prepare does not activate
        assert_eq!(
            route(
                "select 1 -- maxscale named1 prepare route to master",
                &mut reg
            ),
            None
        );
        assert_eq!(
            route("select 2 -- maxscale named1 begin", &mut reg),
            Some(HintTarget::Master)
        );
        assert_eq!(route("select 3 -- maxscale end", &mut reg), None);
    }

    #[test]
    fn named_shorthand_begin() {
        let mut reg = HintRegistry::default();
        assert_eq!(
            route(
                "select 1 -- maxscale shorthand1 begin route to server server2",
                &mut reg
            ),
            Some(HintTarget::Server("server2".to_string()))
        );
        assert_eq!(
            route("select 2", &mut reg),
            Some(HintTarget::Server("server2".to_string()))
        );
        route("select 3 -- maxscale end", &mut reg);
    }

    #[test]
    fn case_and_whitespace_tolerant() {
        let mut reg = HintRegistry::default();
        assert_eq!(
            route("select 1 /*   MaxScale   ROUTE   TO   MASTER  */", &mut reg),
            Some(HintTarget::Master)
        );
    }

    #[test]
    fn malformed_hints_are_ignored() {
        let mut reg = HintRegistry::default();
        assert_eq!(route("select 1 -- maxscale route master", &mut reg), None);
        assert_eq!(route("select 1 -- maxscale route to", &mut reg), None);
        assert_eq!(
            route("select 1 -- maxscale noname frobnicate", &mut reg),
            None
        );
        assert_eq!(route("select 1 -- maxscale begin stray", &mut reg), None);
        // end with no open block is harmless
        assert_eq!(route("select 1 -- maxscale end", &mut reg), None);
        // a begin naming an unprepared hint is ignored
        assert_eq!(route("select 1 -- maxscale ghost begin", &mut reg), None);
    }

    #[test]
    fn comments_inside_strings_are_not_hints() {
        let mut reg = HintRegistry::default();
        assert_eq!(
            route("select '-- maxscale route to master'", &mut reg),
            None
        );
    }
}
