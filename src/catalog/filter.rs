use super::TableInfo;

/// Include/exclude lists of schema or table names, compared case-insensitively.
///
/// An entry matches a table when it equals the schema name, the quoted table
/// id or the plain `schema.table`. Exclusion wins; an empty include list
/// admits every table that is not excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl TableFilter {
    pub fn new<I, E, S, T>(include: I, exclude: E) -> Self
    where
        I: IntoIterator<Item = S>,
        E: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        Self {
            include: normalize(include),
            exclude: normalize(exclude),
        }
    }

    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn is_included(&self, table: &TableInfo) -> bool {
        let names = [
            table.schema.to_lowercase(),
            table.id.to_lowercase(),
            table.qualified_name().to_lowercase(),
        ];
        let listed = |list: &[String]| names.iter().any(|name| list.contains(name));

        if listed(&self.exclude) {
            return false;
        }
        self.include.is_empty() || listed(&self.include)
    }
}

fn normalize<I, S>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .map(|entry| entry.as_ref().trim().to_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}
