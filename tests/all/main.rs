mod consumers;
mod manager;
