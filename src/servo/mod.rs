pub mod protocol;
pub mod sim;
pub mod sts;

#[cfg(test)]
mod tests;
