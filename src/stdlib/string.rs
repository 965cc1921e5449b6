// Luno String Library
// Registered both as the `string` global and as the method table for
// string values, so `s:upper()` works.

use super::{bad_arg, check_int, check_str, native, opt_int, register};
use crate::pattern::{self, Capture, Match};
use crate::vm::table::Table;
use crate::vm::value::{Fault, LunoStr, Value};
use crate::vm::Vm;
use parking_lot::Mutex;
use std::sync::Arc;

pub fn install(vm: &mut Vm) {
    let lib = Table::new_ref();

    register(&lib, "len", |_, args| {
        let s = check_str("len", args, 0)?;
        Ok(vec![Value::Integer(s.len() as i64)])
    });

    register(&lib, "sub", |_, args| {
        let s = check_str("sub", args, 0)?;
        let bytes = s.as_str().as_bytes();
        let i = opt_int("sub", args, 1, 1)?;
        let j = opt_int("sub", args, 2, -1)?;
        let (start, end) = str_range(bytes.len(), i, j);
        Ok(vec![bytes_value(&bytes[start..end])])
    });

    register(&lib, "upper", |_, args| {
        let s = check_str("upper", args, 0)?;
        Ok(vec![Value::from(s.as_str().to_ascii_uppercase())])
    });

    register(&lib, "lower", |_, args| {
        let s = check_str("lower", args, 0)?;
        Ok(vec![Value::from(s.as_str().to_ascii_lowercase())])
    });

    register(&lib, "rep", |_, args| {
        let s = check_str("rep", args, 0)?;
        let n = check_int("rep", args, 1)?;
        let sep = match args.get(2) {
            Some(Value::Str(sep)) => sep.as_str().to_string(),
            _ => String::new(),
        };
        if n <= 0 {
            return Ok(vec![Value::from("")]);
        }
        let mut out = String::with_capacity(s.len() * n as usize);
        for i in 0..n {
            if i > 0 {
                out.push_str(&sep);
            }
            out.push_str(s.as_str());
        }
        Ok(vec![Value::from(out)])
    });

    register(&lib, "reverse", |_, args| {
        let s = check_str("reverse", args, 0)?;
        let mut bytes = s.as_str().as_bytes().to_vec();
        bytes.reverse();
        Ok(vec![bytes_value(&bytes)])
    });

    register(&lib, "byte", |_, args| {
        let s = check_str("byte", args, 0)?;
        let bytes = s.as_str().as_bytes();
        let i = opt_int("byte", args, 1, 1)?;
        let j = opt_int("byte", args, 2, i)?;
        let (start, end) = str_range(bytes.len(), i, j);
        Ok(bytes[start..end]
            .iter()
            .map(|&b| Value::Integer(b as i64))
            .collect())
    });

    register(&lib, "char", |_, args| {
        let mut bytes = Vec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            let n = arg
                .as_integer()
                .filter(|&n| (0..=255).contains(&n))
                .ok_or_else(|| bad_arg("char", i, "value out of range", arg))?;
            bytes.push(n as u8);
        }
        Ok(vec![bytes_value(&bytes)])
    });

    register(&lib, "format", |vm, args| {
        let fmt = check_str("format", args, 0)?;
        let out = format_impl(vm, fmt.as_str(), &args[1..])?;
        Ok(vec![Value::from(out)])
    });

    register(&lib, "find", |vm, args| {
        let s = check_str("find", args, 0)?;
        let pat = check_str("find", args, 1)?;
        let bytes = s.as_str().as_bytes();
        let init = relative_init(bytes.len(), opt_int("find", args, 2, 1)?);
        let plain = Vm::arg(args, 3).is_truthy();
        if plain || !pattern::has_specials(pat.as_str().as_bytes()) {
            return Ok(match plain_find(bytes, pat.as_str().as_bytes(), init) {
                Some((start, end)) => vec![
                    Value::Integer(start as i64 + 1),
                    Value::Integer(end as i64),
                ],
                None => vec![Value::Nil],
            });
        }
        match pattern::find(bytes, pat.as_str().as_bytes(), init).map_err(|e| vm.rt(e.to_string()))? {
            Some(m) => {
                let mut out = vec![
                    Value::Integer(m.start as i64 + 1),
                    Value::Integer(m.end as i64),
                ];
                if !m.captures.is_empty() {
                    out.extend(capture_values(bytes, &m));
                }
                Ok(out)
            }
            None => Ok(vec![Value::Nil]),
        }
    });

    register(&lib, "match", |vm, args| {
        let s = check_str("match", args, 0)?;
        let pat = check_str("match", args, 1)?;
        let bytes = s.as_str().as_bytes();
        let init = relative_init(bytes.len(), opt_int("match", args, 2, 1)?);
        match pattern::find(bytes, pat.as_str().as_bytes(), init).map_err(|e| vm.rt(e.to_string()))? {
            Some(m) => Ok(capture_values(bytes, &m)),
            None => Ok(vec![Value::Nil]),
        }
    });

    register(&lib, "gmatch", |_, args| {
        let s = check_str("gmatch", args, 0)?;
        let pat = check_str("gmatch", args, 1)?;
        let subject: Arc<[u8]> = Arc::from(s.as_str().as_bytes());
        let pat = pat.as_str().to_string();
        let pos = Mutex::new(0usize);
        let iter = native("gmatch_iter", move |vm, _| {
            let mut pos = pos.lock();
            while *pos <= subject.len() {
                match pattern::find(&subject, pat.as_bytes(), *pos)
                    .map_err(|e| vm.rt(e.to_string()))?
                {
                    Some(m) => {
                        // Empty matches advance one byte to guarantee progress.
                        *pos = if m.end > m.start { m.end } else { m.end + 1 };
                        return Ok(capture_values(&subject, &m));
                    }
                    None => break,
                }
            }
            Ok(vec![Value::Nil])
        });
        Ok(vec![iter])
    });

    register(&lib, "gsub", |vm, args| {
        let s = check_str("gsub", args, 0)?;
        let pat = check_str("gsub", args, 1)?;
        let repl = Vm::arg(args, 2);
        let max_n = opt_int("gsub", args, 3, i64::MAX)?;
        gsub_impl(vm, s.as_str().as_bytes(), pat.as_str(), &repl, max_n)
    });

    vm.globals.set("string", Value::Table(lib.clone()));
    vm.globals.string_lib = Some(lib);
}

/// Clamp a 1-based, possibly negative, start position to a byte offset.
fn relative_init(len: usize, init: i64) -> usize {
    if init > 0 {
        (init as usize - 1).min(len)
    } else if init == 0 {
        0
    } else {
        len.saturating_sub((-init) as usize)
    }
}

/// Resolve Lua-style 1-based inclusive (i, j) into a byte range.
fn str_range(len: usize, i: i64, j: i64) -> (usize, usize) {
    let len = len as i64;
    let start = if i < 0 { (len + i + 1).max(1) } else { i.max(1) };
    let end = if j < 0 { len + j + 1 } else { j.min(len) };
    if start > end {
        (0, 0)
    } else {
        ((start - 1) as usize, end as usize)
    }
}

fn bytes_value(bytes: &[u8]) -> Value {
    Value::from(String::from_utf8_lossy(bytes).into_owned())
}

fn plain_find(haystack: &[u8], needle: &[u8], init: usize) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return Some((init, init));
    }
    if init + needle.len() > haystack.len() {
        return None;
    }
    haystack[init..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| (init + i, init + i + needle.len()))
}

/// The values a match produces: its captures, or the whole match when
/// the pattern has none.
fn capture_values(src: &[u8], m: &Match) -> Vec<Value> {
    if m.captures.is_empty() {
        return vec![bytes_value(&src[m.start..m.end])];
    }
    m.captures
        .iter()
        .map(|c| match c {
            Capture::Str { start, end } => bytes_value(&src[*start..*end]),
            Capture::Pos(p) => Value::Integer(*p as i64 + 1),
        })
        .collect()
}

fn gsub_impl(
    vm: &mut Vm,
    src: &[u8],
    pat: &str,
    repl: &Value,
    max_n: i64,
) -> Result<Vec<Value>, Fault> {
    let pat_bytes = pat.as_bytes();
    let anchored = pat_bytes.first() == Some(&b'^');
    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    let mut pos = 0usize;
    let mut count: i64 = 0;
    while count < max_n && pos <= src.len() {
        let m = match pattern::find(src, pat_bytes, pos).map_err(|e| vm.rt(e.to_string()))? {
            Some(m) => m,
            None => break,
        };
        out.extend_from_slice(&src[pos..m.start]);
        apply_replacement(vm, src, &m, repl, &mut out)?;
        count += 1;
        if m.end > m.start {
            pos = m.end;
        } else {
            // Empty match: copy one byte through and move on.
            if m.end < src.len() {
                out.push(src[m.end]);
            }
            pos = m.end + 1;
        }
        if anchored {
            break;
        }
    }
    if pos < src.len() {
        out.extend_from_slice(&src[pos..]);
    }
    Ok(vec![bytes_value(&out), Value::Integer(count)])
}

fn apply_replacement(
    vm: &mut Vm,
    src: &[u8],
    m: &Match,
    repl: &Value,
    out: &mut Vec<u8>,
) -> Result<(), Fault> {
    let whole = &src[m.start..m.end];
    match repl {
        Value::Str(template) => {
            let t = template.as_str().as_bytes();
            let mut i = 0;
            while i < t.len() {
                if t[i] == b'%' && i + 1 < t.len() {
                    let c = t[i + 1];
                    i += 2;
                    if c == b'%' {
                        out.push(b'%');
                    } else if c.is_ascii_digit() {
                        let index = (c - b'0') as usize;
                        if index == 0 {
                            out.extend_from_slice(whole);
                        } else {
                            match m.capture(index - 1) {
                                Some(Capture::Str { start, end }) => {
                                    out.extend_from_slice(&src[start..end])
                                }
                                Some(Capture::Pos(p)) => {
                                    out.extend_from_slice((p + 1).to_string().as_bytes())
                                }
                                None => {
                                    return Err(vm.rt(format!(
                                        "invalid capture index %{} in replacement string",
                                        index
                                    )))
                                }
                            }
                        }
                    } else {
                        return Err(vm.rt("invalid use of '%' in replacement string"));
                    }
                } else {
                    out.push(t[i]);
                    i += 1;
                }
            }
        }
        Value::Table(t) => {
            let key = capture_values(src, m).into_iter().next().unwrap_or(Value::Nil);
            let v = t.lock().raw_get(&key);
            push_result(vm, whole, v, out)?;
        }
        Value::Closure(_) | Value::Native(_) => {
            let call_args = capture_values(src, m);
            let v = vm
                .call_value(repl.clone(), call_args)?
                .into_iter()
                .next()
                .unwrap_or(Value::Nil);
            push_result(vm, whole, v, out)?;
        }
        other => {
            return Err(bad_arg("gsub", 2, "string/function/table", other));
        }
    }
    Ok(())
}

/// A falsy replacement result keeps the original match text.
fn push_result(vm: &mut Vm, whole: &[u8], v: Value, out: &mut Vec<u8>) -> Result<(), Fault> {
    match v {
        Value::Nil | Value::Boolean(false) => out.extend_from_slice(whole),
        Value::Str(s) => out.extend_from_slice(s.as_str().as_bytes()),
        Value::Integer(_) | Value::Float(_) => out.extend_from_slice(v.display().as_bytes()),
        other => {
            return Err(vm.rt(format!(
                "invalid replacement value (a {})",
                other.type_name()
            )))
        }
    }
    Ok(())
}

// ---- string.format -----------------------------------------------------

struct FormatSpec {
    minus: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alt: bool,
    width: usize,
    precision: Option<usize>,
}

fn format_impl(vm: &mut Vm, fmt: &str, args: &[Value]) -> Result<String, Fault> {
    let bytes = fmt.as_bytes();
    let mut out = String::with_capacity(fmt.len());
    let mut i = 0;
    let mut next_arg = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i] as char);
            i += 1;
            continue;
        }
        i += 1;
        if i < bytes.len() && bytes[i] == b'%' {
            out.push('%');
            i += 1;
            continue;
        }
        let mut spec = FormatSpec {
            minus: false,
            plus: false,
            space: false,
            zero: false,
            alt: false,
            width: 0,
            precision: None,
        };
        while i < bytes.len() {
            match bytes[i] {
                b'-' => spec.minus = true,
                b'+' => spec.plus = true,
                b' ' => spec.space = true,
                b'0' => spec.zero = true,
                b'#' => spec.alt = true,
                _ => break,
            }
            i += 1;
        }
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            spec.width = spec.width * 10 + (bytes[i] - b'0') as usize;
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'.' {
            i += 1;
            let mut p = 0;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                p = p * 10 + (bytes[i] - b'0') as usize;
                i += 1;
            }
            spec.precision = Some(p);
        }
        if i >= bytes.len() {
            return Err(vm.rt("invalid format string to 'format'"));
        }
        let conv = bytes[i];
        i += 1;
        let arg = Vm::arg(args, next_arg);
        next_arg += 1;
        let piece = format_one(vm, &spec, conv, &arg, next_arg)?;
        out.push_str(&piece);
    }
    Ok(out)
}

fn format_one(
    vm: &mut Vm,
    spec: &FormatSpec,
    conv: u8,
    arg: &Value,
    argn: usize,
) -> Result<String, Fault> {
    let want_int = |v: &Value| {
        v.as_integer()
            .ok_or_else(|| bad_arg("format", argn - 1, "number", v))
    };
    let want_float = |v: &Value| match v.as_number() {
        Some(n) => Ok(n.as_float()),
        None => Err(bad_arg("format", argn - 1, "number", v)),
    };
    let body = match conv {
        b'd' | b'i' => {
            let n = want_int(arg)?;
            let digits = n.unsigned_abs().to_string();
            let sign = if n < 0 {
                "-"
            } else if spec.plus {
                "+"
            } else if spec.space {
                " "
            } else {
                ""
            };
            return Ok(pad_number(spec, sign, digits));
        }
        b'u' => {
            let n = want_int(arg)?;
            return Ok(pad_number(spec, "", (n as u64).to_string()));
        }
        b'x' => {
            let n = want_int(arg)?;
            let digits = format!("{:x}", n as u64);
            let prefix = if spec.alt { "0x" } else { "" };
            return Ok(pad_number(spec, prefix, digits));
        }
        b'X' => {
            let n = want_int(arg)?;
            let digits = format!("{:X}", n as u64);
            let prefix = if spec.alt { "0X" } else { "" };
            return Ok(pad_number(spec, prefix, digits));
        }
        b'o' => {
            let n = want_int(arg)?;
            return Ok(pad_number(spec, "", format!("{:o}", n as u64)));
        }
        b'c' => {
            let n = want_int(arg)?;
            ((n as u8) as char).to_string()
        }
        b'f' | b'F' => {
            let x = want_float(arg)?;
            let prec = spec.precision.unwrap_or(6);
            let body = format!("{:.*}", prec, x.abs());
            let sign = if x.is_sign_negative() {
                "-"
            } else if spec.plus {
                "+"
            } else if spec.space {
                " "
            } else {
                ""
            };
            return Ok(pad_number(spec, sign, body));
        }
        b'e' | b'E' => {
            let x = want_float(arg)?;
            let prec = spec.precision.unwrap_or(6);
            let mut s = format!("{:.*e}", prec, x);
            // Rust prints `1.5e2`; C prints `1.500000e+02`.
            if let Some(epos) = s.find('e') {
                let (mantissa, exp) = s.split_at(epos);
                let exp: i32 = exp[1..].parse().unwrap_or(0);
                s = format!("{}e{}{:02}", mantissa, if exp < 0 { '-' } else { '+' }, exp.abs());
            }
            if conv == b'E' {
                s = s.to_ascii_uppercase();
            }
            s
        }
        b'g' | b'G' => {
            let x = want_float(arg)?;
            let mut s = crate::vm::value::format_float(x);
            if s.ends_with(".0") {
                s.truncate(s.len() - 2);
            }
            if conv == b'G' {
                s = s.to_ascii_uppercase();
            }
            s
        }
        b's' => {
            let mut s = vm.coerce_to_string(arg)?.as_str().to_string();
            if let Some(p) = spec.precision {
                s.truncate(p);
            }
            s
        }
        b'q' => quote_string(&vm.coerce_to_string(arg)?),
        other => {
            return Err(vm.rt(format!(
                "invalid conversion '%{}' to 'format'",
                other as char
            )))
        }
    };
    Ok(pad_text(spec, body))
}

fn pad_text(spec: &FormatSpec, s: String) -> String {
    if s.len() >= spec.width {
        return s;
    }
    let fill = " ".repeat(spec.width - s.len());
    if spec.minus {
        format!("{}{}", s, fill)
    } else {
        format!("{}{}", fill, s)
    }
}

fn pad_number(spec: &FormatSpec, sign: &str, digits: String) -> String {
    let len = sign.len() + digits.len();
    if len >= spec.width {
        return format!("{}{}", sign, digits);
    }
    let fill = spec.width - len;
    if spec.minus {
        format!("{}{}{}", sign, digits, " ".repeat(fill))
    } else if spec.zero {
        format!("{}{}{}", sign, "0".repeat(fill), digits)
    } else {
        format!("{}{}{}", " ".repeat(fill), sign, digits)
    }
}

fn quote_string(s: &LunoStr) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for b in s.as_str().bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0 => out.push_str("\\0"),
            b if b < 32 || b == 127 => out.push_str(&format!("\\{}", b)),
            b => out.push(b as char),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use crate::vm::value::Value;
    use crate::vm::Vm;

    fn run(src: &str) -> Vec<Value> {
        Vm::new().run_source(src, "test.luno").expect("runs")
    }

    fn run1(src: &str) -> String {
        run(src)[0].display()
    }

    #[test]
    fn sub_with_negative_indices() {
        assert_eq!(run1("return string.sub('hello', 2)"), "ello");
        assert_eq!(run1("return string.sub('hello', -3)"), "llo");
        assert_eq!(run1("return string.sub('hello', 2, -2)"), "ell");
        assert_eq!(run1("return string.sub('hello', 9)"), "");
    }

    #[test]
    fn case_and_rep() {
        assert_eq!(run1("return string.upper('abC')"), "ABC");
        assert_eq!(run1("return string.lower('AbC')"), "abc");
        assert_eq!(run1("return string.rep('ab', 3)"), "ababab");
        assert_eq!(run1("return string.rep('a', 3, '-')"), "a-a-a");
        assert_eq!(run1("return string.reverse('abc')"), "cba");
    }

    #[test]
    fn byte_and_char_round() {
        let out = run("return string.byte('AB', 1, 2)");
        assert!(out[0].raw_eq(&Value::Integer(65)));
        assert!(out[1].raw_eq(&Value::Integer(66)));
        assert_eq!(run1("return string.char(104, 105)"), "hi");
    }

    #[test]
    fn method_syntax_on_strings() {
        assert_eq!(run1("local s = 'luno' return s:upper()"), "LUNO");
        assert_eq!(run1("return ('abc'):len()"), "3");
    }

    #[test]
    fn format_specifiers() {
        assert_eq!(run1("return string.format('%d/%d', 7, -2)"), "7/-2");
        assert_eq!(run1("return string.format('%5d', 42)"), "   42");
        assert_eq!(run1("return string.format('%-5d|', 42)"), "42   |");
        assert_eq!(run1("return string.format('%05d', 42)"), "00042");
        assert_eq!(run1("return string.format('%x', 255)"), "ff");
        assert_eq!(run1("return string.format('%X', 255)"), "FF");
        assert_eq!(run1("return string.format('%o', 8)"), "10");
        assert_eq!(run1("return string.format('%.2f', 3.14159)"), "3.14");
        assert_eq!(run1("return string.format('%s=%s', 'a', 1)"), "a=1");
        assert_eq!(run1("return string.format('%.3s', 'abcdef')"), "abc");
        assert_eq!(run1("return string.format('%c%c', 104, 105)"), "hi");
        assert_eq!(run1("return string.format('100%%')"), "100%");
        assert_eq!(run1("return string.format('%q', 'a\"b')"), "\"a\\\"b\"");
    }

    #[test]
    fn find_returns_one_based_span() {
        let out = run("return string.find('hello world', 'world')");
        assert!(out[0].raw_eq(&Value::Integer(7)));
        assert!(out[1].raw_eq(&Value::Integer(11)));
    }

    #[test]
    fn find_plain_ignores_magic() {
        let out = run("return string.find('a.b', '.', 1, true)");
        assert!(out[0].raw_eq(&Value::Integer(2)));
    }

    #[test]
    fn find_reports_captures() {
        let out = run("return string.find('key=val', '(%w+)=(%w+)')");
        assert!(out[0].raw_eq(&Value::Integer(1)));
        assert!(out[1].raw_eq(&Value::Integer(7)));
        assert_eq!(out[2].display(), "key");
        assert_eq!(out[3].display(), "val");
    }

    #[test]
    fn match_returns_captures() {
        assert_eq!(run1("return string.match('hello 42', '%d+')"), "42");
        let out = run("return string.match('2026-08-27', '(%d+)-(%d+)-(%d+)')");
        assert_eq!(out[0].display(), "2026");
        assert_eq!(out[2].display(), "27");
        let out = run("return string.match('abc', '%d+')");
        assert!(out[0].is_nil());
    }

    #[test]
    fn gmatch_iterates_all_matches() {
        let out = run(
            "local words = {}\nfor w in string.gmatch('one two three', '%a+') do\n  words[#words + 1] = w\nend\nreturn #words, words[2]",
        );
        assert!(out[0].raw_eq(&Value::Integer(3)));
        assert_eq!(out[1].display(), "two");
    }

    #[test]
    fn gsub_with_string_replacement() {
        let out = run("return string.gsub('hello world', 'o', '0')");
        assert_eq!(out[0].display(), "hell0 w0rld");
        assert!(out[1].raw_eq(&Value::Integer(2)));
    }

    #[test]
    fn gsub_capture_template() {
        assert_eq!(
            run1("return (string.gsub('key=val', '(%w+)=(%w+)', '%2=%1'))"),
            "val=key"
        );
    }

    #[test]
    fn gsub_with_limit() {
        let out = run("return string.gsub('aaa', 'a', 'b', 2)");
        assert_eq!(out[0].display(), "bba");
        assert!(out[1].raw_eq(&Value::Integer(2)));
    }

    #[test]
    fn gsub_with_function_replacement() {
        let out = run(
            "return (string.gsub('1 2 3', '%d', function(d) return tostring(tonumber(d) * 2) end))",
        );
        assert_eq!(out[0].display(), "2 4 6");
    }

    #[test]
    fn gsub_with_table_replacement() {
        let out = run(
            "return (string.gsub('$name is $job', '%$(%w+)', { name = 'ada', job = 'analyst' }))",
        );
        assert_eq!(out[0].display(), "ada is analyst");
    }

    #[test]
    fn gsub_falsy_result_keeps_original() {
        let out = run("return (string.gsub('ab', '%a', function() return nil end))");
        assert_eq!(out[0].display(), "ab");
    }
}
