use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_until, take_while1},
    character::complete::{char, digit1, multispace0, multispace1},
    combinator::{map, map_res, opt, recognize},
    multi::separated_list0,
    sequence::{delimited, preceded, tuple},
    IResult,
};

use crate::model::MDType;

#[derive(Debug, PartialEq, Clone)]
pub enum Command {
    Create { fid: String },
    Tsuid { fid: String },
    Fid { tsuid: String },
    Import { fid: String, points: Vec<(i64, f64)>, parent: Option<String> },
    Fetch { fid: String, range: Option<(i64, i64)> },
    Meta { fid: String },
    Set { fid: String, name: String, value: String, dtype: Option<MDType> },
    Find { name: String, value: String },
    Delete { fid: String },
    List,
    Tables,
    Operators,
    Help,
    Exit,
}

// --- BASIC PARSERS ---

fn parse_float(input: &str) -> IResult<&str, f64> {
    let (input, num_str) = recognize(tuple((
        opt(char('-')),
        digit1,
        opt(tuple((char('.'), digit1))),
        opt(tuple((alt((char('e'), char('E'))), opt(alt((char('-'), char('+')))), digit1))),
    )))(input)?;
    match num_str.parse::<f64>() {
        Ok(n) => Ok((input, n)),
        Err(_) => Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))),
    }
}

fn parse_i64(input: &str) -> IResult<&str, i64> {
    map_res(recognize(tuple((opt(char('-')), digit1))), |s: &str| s.parse::<i64>())(input)
}

fn parse_quoted_string(input: &str) -> IResult<&str, String> {
    let (input, _) = char('"')(input)?;
    let (input, content) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, content.to_string()))
}

/// `'fid'` or a bare word.
fn parse_ident(input: &str) -> IResult<&str, String> {
    let quoted = delimited(char('\''), take_until("'"), char('\''));
    let bare = take_while1(|c: char| !c.is_whitespace() && c != '=' && c != '\'');
    map(alt((quoted, bare)), str::to_string)(input)
}

fn parse_name(input: &str) -> IResult<&str, String> {
    map(take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '.' || c == '-'), str::to_string)(input)
}

fn parse_point(input: &str) -> IResult<&str, (i64, f64)> {
    let (input, _) = ws(char('('))(input)?;
    let (input, timestamp) = parse_i64(input)?;
    let (input, _) = ws(char(','))(input)?;
    let (input, value) = parse_float(input)?;
    let (input, _) = ws(char(')'))(input)?;
    Ok((input, (timestamp, value)))
}

fn parse_points(input: &str) -> IResult<&str, Vec<(i64, f64)>> {
    delimited(ws(char('[')), separated_list0(char(','), parse_point), ws(char(']')))(input)
}

fn parse_dtype(input: &str) -> IResult<&str, MDType> {
    map_res(
        alt((tag_ci("STRING"), tag_ci("DATE"), tag_ci("NUMBER"), tag_ci("COMPLEX"))),
        |s: &str| s.parse::<MDType>(),
    )(input)
}

// --- HELPERS ---
fn ws<'a, F, O, E: nom::error::ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where F: FnMut(&'a str) -> IResult<&'a str, O, E> {
    delimited(multispace0, inner, multispace0)
}

fn tag_ci(t: &'static str) -> impl FnMut(&str) -> IResult<&str, &str> {
    move |input| tag_no_case(t)(input)
}

/// Keyword followed by whitespace, then an identifier.
fn keyword_ident(kw: &'static str) -> impl FnMut(&str) -> IResult<&str, String> {
    move |input| {
        let (input, _) = tag_ci(kw)(input)?;
        let (input, _) = multispace1(input)?;
        parse_ident(input)
    }
}

// --- COMMAND PARSERS ---

fn parse_create(input: &str) -> IResult<&str, Command> {
    let (input, fid) = keyword_ident("CREATE")(input)?;
    Ok((input, Command::Create { fid }))
}

fn parse_tsuid(input: &str) -> IResult<&str, Command> {
    let (input, fid) = keyword_ident("TSUID")(input)?;
    Ok((input, Command::Tsuid { fid }))
}

fn parse_fid(input: &str) -> IResult<&str, Command> {
    let (input, tsuid) = keyword_ident("FID")(input)?;
    Ok((input, Command::Fid { tsuid }))
}

fn parse_import(input: &str) -> IResult<&str, Command> {
    let (input, fid) = keyword_ident("IMPORT")(input)?;
    let (input, _) = ws(tag_ci("VALUES"))(input)?;
    let (input, points) = parse_points(input)?;
    let (input, parent) = opt(preceded(ws(tag_ci("PARENT")), parse_ident))(input)?;
    Ok((input, Command::Import { fid, points, parent }))
}

fn parse_fetch(input: &str) -> IResult<&str, Command> {
    let (input, fid) = keyword_ident("FETCH")(input)?;
    let (input, range) = opt(tuple((
        preceded(ws(tag_ci("FROM")), parse_i64),
        preceded(ws(tag_ci("TO")), parse_i64),
    )))(input)?;
    Ok((input, Command::Fetch { fid, range }))
}

fn parse_meta(input: &str) -> IResult<&str, Command> {
    let (input, fid) = keyword_ident("META")(input)?;
    Ok((input, Command::Meta { fid }))
}

fn parse_set(input: &str) -> IResult<&str, Command> {
    let (input, fid) = keyword_ident("SET")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, name) = parse_name(input)?;
    let (input, _) = ws(char('='))(input)?;
    let (input, value) = parse_quoted_string(input)?;
    let (input, dtype) = opt(preceded(ws(tag_ci("AS")), parse_dtype))(input)?;
    Ok((input, Command::Set { fid, name, value, dtype }))
}

fn parse_find(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("FIND")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, name) = parse_name(input)?;
    let (input, _) = ws(char('='))(input)?;
    let (input, value) = parse_quoted_string(input)?;
    Ok((input, Command::Find { name, value }))
}

fn parse_delete(input: &str) -> IResult<&str, Command> {
    let (input, fid) = keyword_ident("DELETE")(input)?;
    Ok((input, Command::Delete { fid }))
}

fn parse_list(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("LIST")(input)?;
    Ok((input, Command::List))
}

fn parse_tables(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("TABLES")(input)?;
    Ok((input, Command::Tables))
}

fn parse_operators(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("OPERATORS")(input)?;
    Ok((input, Command::Operators))
}

fn parse_help(input: &str) -> IResult<&str, Command> {
    let (input, _) = tag_ci("HELP")(input)?;
    Ok((input, Command::Help))
}

fn parse_exit(input: &str) -> IResult<&str, Command> {
    let (input, _) = alt((tag_ci("EXIT"), tag_ci("QUIT")))(input)?;
    Ok((input, Command::Exit))
}

pub fn parse_command(input: &str) -> Result<Command, String> {
    let input = input.trim();
    let result = alt((
        parse_create,
        parse_tsuid,
        parse_fid,
        parse_import,
        parse_fetch,
        parse_meta,
        parse_set,
        parse_find,
        parse_delete,
        parse_list,
        parse_tables,
        parse_operators,
        parse_help,
        parse_exit,
    ))(input);

    match result {
        Ok((remainder, cmd)) => {
            if !remainder.trim().is_empty() {
                return Err(format!("Unexpected tokens at end: '{}'", remainder));
            }
            Ok(cmd)
        },
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let context: String = e.input.chars().take(20).collect();
            let ellipsis = if e.input.chars().count() > 20 { "..." } else { "" };
            Err(format!("Invalid syntax near: '{}{}'", context, ellipsis))
        },
        Err(nom::Err::Incomplete(_)) => Err("Incomplete command.".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identifier_commands() {
        assert_eq!(parse_command("CREATE 'my_fid'"), Ok(Command::Create { fid: "my_fid".into() }));
        assert_eq!(parse_command("tsuid my_fid"), Ok(Command::Tsuid { fid: "my_fid".into() }));
        assert_eq!(parse_command("FID '000001000001000001'"), Ok(Command::Fid { tsuid: "000001000001000001".into() }));
        assert_eq!(parse_command("  delete 'x_y'  "), Ok(Command::Delete { fid: "x_y".into() }));
        assert_eq!(parse_command("FIND unit = \"m/s\""), Ok(Command::Find { name: "unit".into(), value: "m/s".into() }));
    }

    #[test]
    fn test_import_with_parent() {
        let cmd = parse_command("IMPORT 'child' VALUES [(1000, 1.5), (2000, -2), (3000, 1e3)] PARENT 'parent'").unwrap();
        assert_eq!(
            cmd,
            Command::Import {
                fid: "child".into(),
                points: vec![(1000, 1.5), (2000, -2.0), (3000, 1000.0)],
                parent: Some("parent".into()),
            }
        );
        assert_eq!(
            parse_command("IMPORT fid1 VALUES []"),
            Ok(Command::Import { fid: "fid1".into(), points: vec![], parent: None })
        );
    }

    #[test]
    fn test_fetch_range_is_optional() {
        assert_eq!(parse_command("FETCH 'f1'"), Ok(Command::Fetch { fid: "f1".into(), range: None }));
        assert_eq!(
            parse_command("fetch 'f1' from 10 to 20"),
            Ok(Command::Fetch { fid: "f1".into(), range: Some((10, 20)) })
        );
    }

    #[test]
    fn test_set_with_type() {
        assert_eq!(
            parse_command("SET 'f1' unit = \"meters\""),
            Ok(Command::Set { fid: "f1".into(), name: "unit".into(), value: "meters".into(), dtype: None })
        );
        assert_eq!(
            parse_command("SET 'f1' phase = \"8\" AS number"),
            Ok(Command::Set { fid: "f1".into(), name: "phase".into(), value: "8".into(), dtype: Some(MDType::Number) })
        );
    }

    #[test]
    fn test_errors_are_reported() {
        assert!(parse_command("IMPORT 'f' VALUES [(1, )]").is_err());
        assert!(parse_command("LIST everything").unwrap_err().starts_with("Unexpected tokens"));
        assert!(parse_command("DROP 'f'").unwrap_err().starts_with("Invalid syntax"));
        assert_eq!(parse_command("quit"), Ok(Command::Exit));
    }

    #[test]
    fn test_catalog_listings() {
        assert_eq!(parse_command("tables"), Ok(Command::Tables));
        assert_eq!(parse_command(" OPERATORS "), Ok(Command::Operators));
        assert!(parse_command("TABLES 'x'").is_err());
    }
}
